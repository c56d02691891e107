//! CPU rendition of a display's warped output
//!
//! Each surface gets a generated test card in place of its offscreen image,
//! so vertex calibration can be checked without the renderer running.

use anyhow::Result;
use image::{ImageOutputFormat, Rgba, RgbaImage};
use std::io::Cursor;
use tracing::debug;

use crate::topology::Topology;
use crate::warp::{compute_warp_transform, warp_onto};

const CARD_WIDTH: u32 = 320;
const CARD_CELLS: u32 = 8;

const PALETTE: [[u8; 3]; 4] = [[230, 80, 60], [60, 160, 230], [90, 200, 90], [230, 200, 60]];

/// Checkerboard tinted per surface, with a white outline and center cross
pub fn test_card(width: u32, height: u32, surface: usize) -> RgbaImage {
    let [r, g, b] = PALETTE[surface % PALETTE.len()];
    let cell = (width / CARD_CELLS).max(1);
    let border = (width / 160).max(1);

    RgbaImage::from_fn(width, height, |x, y| {
        let on_border = x < border || y < border || x >= width - border || y >= height - border;
        let on_cross = x.abs_diff(width / 2) < border || y.abs_diff(height / 2) < border;
        if on_border || on_cross {
            return Rgba([255, 255, 255, 255]);
        }
        let shade = if ((x / cell) + (y / cell)) % 2 == 0 { 1.0 } else { 0.35 };
        let tint = |c: u8| (c as f64 * shade).round() as u8;
        Rgba([tint(r), tint(g), tint(b), 255])
    })
}

/// Composite every surface of `display` onto a black frame
pub fn render_display_preview(
    topology: &Topology,
    display: usize,
    width: u32,
    height: u32,
) -> RgbaImage {
    let mut frame = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 255]));
    let aspect = topology.texture_aspect;
    let card_height = ((CARD_WIDTH as f64 / aspect).round() as u32).max(1);

    for surface in topology.surfaces_on_display(display) {
        match compute_warp_transform(&surface.reference_quad, &surface.render_quad) {
            Ok(warp) => {
                let card = test_card(CARD_WIDTH, card_height, surface.id);
                warp_onto(&mut frame, &card, &surface.render_quad, &warp);
            }
            Err(e) => debug!("Preview leaves out surface {}: {}", surface.id, e),
        }
    }

    frame
}

/// Encode an image as PNG
pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut png_data = Vec::new();
    let mut cursor = Cursor::new(&mut png_data);
    image.write_to(&mut cursor, ImageOutputFormat::Png)?;

    Ok(png_data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::homography::Point;

    const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);

    #[test]
    fn test_card_layout() {
        let card = test_card(64, 32, 1);
        assert_eq!(card.dimensions(), (64, 32));
        assert_eq!(*card.get_pixel(0, 0), Rgba([255, 255, 255, 255]));
        assert_eq!(*card.get_pixel(32, 16), Rgba([255, 255, 255, 255]));
        // Bright and dark cells alternate
        assert_eq!(*card.get_pixel(4, 4), Rgba([60, 160, 230, 255]));
        let dark = card.get_pixel(12, 4);
        assert!(dark[0] < 60 && dark[1] < 160 && dark[2] < 230);
        assert_eq!(dark[3], 255);
    }

    #[test]
    fn test_preview_covers_the_vertex_quad() {
        let topology = Topology::from_config(&Config::default(), None).unwrap();
        let preview = render_display_preview(&topology, 0, 200, 100);

        assert_eq!(preview.dimensions(), (200, 100));
        // Vertices are inset by 2%: the outermost pixels stay black
        assert_eq!(*preview.get_pixel(0, 0), BLACK);
        assert_eq!(*preview.get_pixel(199, 99), BLACK);
        assert_ne!(*preview.get_pixel(60, 30), BLACK);
    }

    #[test]
    fn test_preview_of_unused_display_is_black() {
        let topology = Topology::from_config(&Config::default(), None).unwrap();
        let preview = render_display_preview(&topology, 7, 32, 16);
        assert!(preview.pixels().all(|p| *p == BLACK));
    }

    #[test]
    fn test_degenerate_surface_is_left_out() {
        let mut config = Config::default();
        config.surfaces[0].vertices.corners[1] = Point::new(0.5, 0.5);
        let topology = Topology::from_config(&config, None).unwrap();
        let preview = render_display_preview(&topology, 0, 32, 16);
        assert!(preview.pixels().all(|p| *p == BLACK));
    }

    #[test]
    fn test_encode_png() {
        let png = encode_png(&test_card(16, 8, 0)).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }
}
