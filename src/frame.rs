//! Per-frame matrix computation
//!
//! The head is sampled once at the start of a frame and passed by value to
//! every surface, so adjacent surfaces always agree on where the viewer is.

use anyhow::Result;
use rayon::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{GeometryError, GeometryResult};
use crate::projection::{matrix_rows, ClipPlanes, ProjectionParameters, SurfaceKind};
use crate::server::AppState;
use crate::topology::{ProjectorRig, Surface, Topology, TrackedHead};
use crate::warp::WarpCache;

/// Everything the renderer needs to draw one surface this frame
#[derive(Debug, Clone, Serialize)]
pub struct SurfaceFrame {
    pub surface: usize,
    pub display: usize,
    pub kind: SurfaceKind,
    pub parameters: ProjectionParameters,
    /// Row-major 4x4 projection for the surface's offscreen pass
    pub projection: [[f64; 4]; 4],
    /// Row-major 4x4 world-to-camera matrix
    pub view: [[f64; 4]; 4],
    /// Row-major 3x3 sampling transform for the warped draw
    pub warp: [[f64; 3]; 3],
}

/// A surface left out of this frame
#[derive(Debug, Clone, Serialize)]
pub struct SkippedSurface {
    pub surface: usize,
    pub display: usize,
    pub reason: String,
    #[serde(skip)]
    pub error: Option<GeometryError>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameOutput {
    pub sequence: u64,
    /// Topology revision the frame was computed from
    pub revision: u64,
    pub head: TrackedHead,
    pub surfaces: Vec<SurfaceFrame>,
    pub skipped: Vec<SkippedSurface>,
}

impl FrameOutput {
    pub fn surface(&self, id: usize) -> Option<&SurfaceFrame> {
        self.surfaces.iter().find(|s| s.surface == id)
    }
}

/// Camera of a physical projector, used to draw its surfaces into its output
#[derive(Debug, Clone, Serialize)]
pub struct ProjectorFrame {
    pub display: usize,
    pub fov_degrees: f64,
    pub lens_shift: f64,
    pub aspect: f64,
    pub near: f64,
    pub far: f64,
    /// Surfaces warped onto this projector's output
    pub surfaces: Vec<usize>,
    pub projection: [[f64; 4]; 4],
    pub view: [[f64; 4]; 4],
}

pub fn compute_projector(rig: &ProjectorRig) -> GeometryResult<ProjectorFrame> {
    let projection = rig.projection()?;
    Ok(ProjectorFrame {
        display: rig.display,
        fov_degrees: rig.fov_degrees,
        lens_shift: rig.lens_shift,
        aspect: rig.aspect,
        near: rig.clip.near,
        far: rig.clip.far,
        surfaces: rig.surfaces.clone(),
        projection: matrix_rows(&projection),
        view: matrix_rows(&rig.view_matrix()),
    })
}

/// Projection, view and warp for one surface
pub fn compute_surface(
    surface: &Surface,
    cache: &WarpCache,
    head: TrackedHead,
    clip: ClipPlanes,
) -> GeometryResult<SurfaceFrame> {
    let parameters = surface.projection(&head, clip)?;
    let projection = parameters.matrix()?;
    let warp = surface.warp(cache)?;

    Ok(SurfaceFrame {
        surface: surface.id,
        display: surface.display,
        kind: surface.kind,
        parameters,
        projection: matrix_rows(&projection),
        view: matrix_rows(&surface.view_matrix(&head)),
        warp: warp.rows(),
    })
}

/// Compute every surface in parallel. Failing surfaces are listed in
/// `skipped` and do not affect the others.
pub fn compute_frame(
    topology: &Topology,
    cache: &WarpCache,
    head: TrackedHead,
    clip: ClipPlanes,
    sequence: u64,
) -> FrameOutput {
    let results: Vec<(&Surface, GeometryResult<SurfaceFrame>)> = topology
        .surfaces()
        .par_iter()
        .map(|surface| (surface, compute_surface(surface, cache, head, clip)))
        .collect();

    let mut output = FrameOutput {
        sequence,
        revision: topology.revision,
        head,
        surfaces: Vec::with_capacity(results.len()),
        skipped: Vec::new(),
    };

    for (surface, result) in results {
        match result {
            Ok(frame) => output.surfaces.push(frame),
            Err(e) => {
                debug!("Surface {} skipped in frame {}: {}", surface.id, sequence, e);
                output.skipped.push(SkippedSurface {
                    surface: surface.id,
                    display: surface.display,
                    reason: e.to_string(),
                    error: Some(e),
                });
            }
        }
    }

    output
}

/// Compute and publish frames at the configured rate until shutdown is requested
pub fn run_frame_loop(state: Arc<AppState>) -> Result<()> {
    let fps = state.config.read().render.fps.max(1);
    let frame_interval = Duration::from_secs_f64(1.0 / f64::from(fps));

    info!("=== cavewarp frame loop ===");
    info!("Target rate: {} fps", fps);

    let mut sequence = 0u64;
    let mut frames_since_stats = 0u32;
    let mut compute_time = Duration::ZERO;
    let mut last_stats_time = Instant::now();
    let stats_interval = Duration::from_secs(10);
    let mut last_skipped: Vec<(usize, String)> = Vec::new();

    while !state.is_shutdown_requested() {
        let started = Instant::now();

        let topology = state.topology();
        let head = state.head();
        let frame = compute_frame(&topology, state.warp_cache(), head, topology.clip, sequence);

        // Only report changes, not every frame
        let skipped: Vec<(usize, String)> = frame
            .skipped
            .iter()
            .map(|s| (s.surface, s.reason.clone()))
            .collect();
        if skipped != last_skipped {
            for s in &frame.skipped {
                warn!("Skipping surface {} on display {}: {}", s.surface, s.display + 1, s.reason);
            }
            if skipped.is_empty() {
                info!("All surfaces rendering again");
            }
            last_skipped = skipped;
        }

        state.publish_frame(frame);
        sequence += 1;
        frames_since_stats += 1;
        compute_time += started.elapsed();

        if last_stats_time.elapsed() >= stats_interval {
            let elapsed = last_stats_time.elapsed().as_secs_f64();
            info!(
                "Frames: {} | {:.1} fps | avg compute {:?} | skipped surfaces: {}",
                sequence,
                frames_since_stats as f64 / elapsed,
                compute_time / frames_since_stats,
                last_skipped.len()
            );
            frames_since_stats = 0;
            compute_time = Duration::ZERO;
            last_stats_time = Instant::now();
        }

        let elapsed = started.elapsed();
        if elapsed < frame_interval {
            std::thread::sleep(frame_interval - elapsed);
        }
    }

    info!("Frame loop stopped after {} frames", sequence);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::homography::Point;
    use parking_lot::RwLock;

    fn default_topology() -> Topology {
        Topology::from_config(&Config::default(), None).unwrap()
    }

    #[test]
    fn test_all_surfaces_computed() {
        let topology = default_topology();
        let cache = WarpCache::new();
        let frame = compute_frame(&topology, &cache, TrackedHead::default(), topology.clip, 7);

        assert_eq!(frame.sequence, 7);
        assert_eq!(frame.surfaces.len(), 3);
        assert!(frame.skipped.is_empty());
        assert_eq!(cache.len(), 3);

        // Ordered like the topology
        let ids: Vec<usize> = frame.surfaces.iter().map(|s| s.surface).collect();
        assert_eq!(ids, vec![0, 1, 2]);

        // Screens are not warped
        let screen = frame.surface(2).unwrap();
        for (r, row) in screen.warp.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                let expected = if r == c { 1.0 } else { 0.0 };
                assert!((value - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_head_is_shared_by_all_surfaces() {
        let topology = default_topology();
        let cache = WarpCache::new();
        let head = TrackedHead::new(0.3, 1.2, -0.4);
        let frame = compute_frame(&topology, &cache, head, topology.clip, 0);

        assert_eq!(frame.head, head);
        for s in &frame.surfaces {
            let surface = topology.surface(s.surface).unwrap();
            let expected = surface.projection(&head, topology.clip).unwrap();
            assert_eq!(s.parameters, expected);
        }
    }

    #[test]
    fn test_head_on_floor_skips_only_the_floor() {
        let topology = default_topology();
        let cache = WarpCache::new();
        let head = TrackedHead::new(0.0, 0.0, 0.0);
        let frame = compute_frame(&topology, &cache, head, topology.clip, 0);

        assert_eq!(frame.surfaces.len(), 2);
        assert_eq!(frame.skipped.len(), 1);
        assert_eq!(frame.skipped[0].surface, 1);
        assert!(matches!(
            frame.skipped[0].error,
            Some(GeometryError::ZeroDistance { .. })
        ));
    }

    #[test]
    fn test_degenerate_vertices_skip_surface() {
        let mut config = Config::default();
        config.surfaces[0].vertices.corners[1] = Point::new(0.5, 0.5);
        let topology = Topology::from_config(&config, None).unwrap();
        let cache = WarpCache::new();
        let frame = compute_frame(&topology, &cache, TrackedHead::default(), topology.clip, 0);

        assert_eq!(frame.skipped.len(), 1);
        assert_eq!(frame.skipped[0].surface, 0);
        assert_eq!(frame.skipped[0].error, Some(GeometryError::DegenerateQuad));
    }

    #[test]
    fn test_projector_frames() {
        let topology = default_topology();
        let frames: Vec<ProjectorFrame> = topology
            .projectors()
            .iter()
            .map(|rig| compute_projector(rig).unwrap())
            .collect();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].display, 0);
        assert_eq!(frames[0].surfaces, vec![0]);
        assert!((frames[0].far - 8.0).abs() < 1e-9);
        assert_eq!(frames[0].projection[3], [0.0, 0.0, -1.0, 0.0]);
        assert_eq!(frames[1].surfaces, vec![1]);
    }

    #[test]
    fn test_frame_loop_publishes_until_shutdown() {
        let mut config = Config::default();
        config.render.fps = 200;
        let config = Arc::new(RwLock::new(config));
        let path = std::env::temp_dir().join("cavewarp-frame-loop-unused.toml");
        let state = Arc::new(AppState::new(config, path).unwrap());

        let loop_state = state.clone();
        let handle = std::thread::spawn(move || run_frame_loop(loop_state));
        std::thread::sleep(Duration::from_millis(100));
        state.request_shutdown();
        handle.join().unwrap().unwrap();

        let frame = state.latest_frame();
        assert_eq!(frame.surfaces.len(), 3);
        assert!(frame.sequence > 0);
    }
}
