//! Warp compositor
//!
//! Combines the reference-quad homography with the inverse of a surface's
//! physical-quad homography. The result maps a render-space position inside
//! the physical quad back into the reference sampling space of the surface's
//! offscreen image.

use arc_swap::ArcSwap;
use image::{Rgba, RgbaImage};
use rayon::prelude::*;
use std::collections::HashMap;

use crate::error::GeometryResult;
use crate::homography::{Homography, Point, Quad};

/// `H(reference) * H(physical)^-1`
pub fn compute_warp_transform(reference: &Quad, physical: &Quad) -> GeometryResult<Homography> {
    let reference_h = reference.homography()?;
    let physical_h = physical.homography()?;
    Ok(reference_h * physical_h.try_inverse()?)
}

#[derive(Debug, Clone, Copy)]
struct CachedWarp {
    version: u64,
    result: GeometryResult<Homography>,
}

/// Warp matrices memoized per surface and keyed by configuration version.
///
/// The published map is swapped as a whole; an entry is never changed in
/// place. Failures are cached as well, so a degenerate surface reports its
/// error every frame without being re-solved every frame.
pub struct WarpCache {
    entries: ArcSwap<HashMap<usize, CachedWarp>>,
}

impl WarpCache {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Cached warp for `surface` at `version`, solving it on a miss
    pub fn get_or_compute(
        &self,
        surface: usize,
        version: u64,
        reference: &Quad,
        physical: &Quad,
    ) -> GeometryResult<Homography> {
        if let Some(entry) = self.entries.load().get(&surface) {
            if entry.version == version {
                return entry.result;
            }
        }

        let result = compute_warp_transform(reference, physical);
        self.entries.rcu(|entries| {
            let mut next = HashMap::clone(entries);
            match next.get(&surface) {
                // Another frame already stored a newer configuration
                Some(existing) if existing.version > version => {}
                _ => {
                    next.insert(surface, CachedWarp { version, result });
                }
            }
            next
        });
        result
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WarpCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Draw `source` onto the part of `frame` covered by `physical`.
///
/// Each frame pixel center inside the quad is mapped through `warp` into the
/// reference space (normalized source coordinates) and sampled bilinearly.
/// Pixels outside the quad are left as they are.
pub fn warp_onto(frame: &mut RgbaImage, source: &RgbaImage, physical: &Quad, warp: &Homography) {
    let (width, height) = frame.dimensions();
    let (src_w, src_h) = source.dimensions();
    if width == 0 || height == 0 || src_w == 0 || src_h == 0 {
        return;
    }

    let stride = width as usize * 4;
    let pixels: &mut [u8] = &mut **frame;

    pixels
        .par_chunks_mut(stride)
        .enumerate()
        .for_each(|(y, row)| {
            let py = (y as f64 + 0.5) / height as f64;
            for (x, out) in row.chunks_exact_mut(4).enumerate() {
                let p = Point::new((x as f64 + 0.5) / width as f64, py);
                if !physical.contains(p) {
                    continue;
                }
                let Some(uv) = warp.transform_point(p) else {
                    continue;
                };
                let sx = uv.x * src_w as f64 - 0.5;
                let sy = uv.y * src_h as f64 - 0.5;
                out.copy_from_slice(&sample_bilinear(source, sx, sy).0);
            }
        });
}

/// Bilinear lookup at a continuous pixel position, clamped to the image edge
#[inline]
fn sample_bilinear(source: &RgbaImage, x: f64, y: f64) -> Rgba<u8> {
    let (width, height) = source.dimensions();
    let x = x.clamp(0.0, (width - 1) as f64);
    let y = y.clamp(0.0, (height - 1) as f64);

    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(width - 1), (y0 + 1).min(height - 1));
    let (fx, fy) = (x - x0 as f64, y - y0 as f64);

    let top_left = source.get_pixel(x0, y0);
    let top_right = source.get_pixel(x1, y0);
    let bottom_left = source.get_pixel(x0, y1);
    let bottom_right = source.get_pixel(x1, y1);

    Rgba(std::array::from_fn(|c| {
        let top = top_left[c] as f64 * (1.0 - fx) + top_right[c] as f64 * fx;
        let bottom = bottom_left[c] as f64 * (1.0 - fx) + bottom_right[c] as f64 * fx;
        (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
    }))
}
