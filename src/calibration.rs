//! Vertex point management for quad-warp calibration

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::homography::{Point, Quad};

const CORNER_LABELS: [&str; 4] = ["Top Left", "Top Right", "Bottom Right", "Bottom Left"];

/// A labeled render-space vertex for the UI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VertexPoint {
    pub surface: usize,
    pub corner: usize,
    /// One-based display, as in the installation file
    pub display: usize,
    pub label: String,
    pub x: f64,
    pub y: f64,
}

/// All vertices of every projector surface
pub fn vertex_points(config: &Config) -> Vec<VertexPoint> {
    config
        .surfaces
        .iter()
        .enumerate()
        .flat_map(|(surface, cfg)| {
            cfg.vertices
                .corners
                .iter()
                .zip(CORNER_LABELS)
                .enumerate()
                .map(move |(corner, (p, label))| VertexPoint {
                    surface,
                    corner,
                    display: cfg.display,
                    label: label.to_string(),
                    x: p.x,
                    y: p.y,
                })
        })
        .collect()
}

/// Move one vertex. Returns false for an unknown surface or corner.
pub fn update_vertex(config: &mut Config, surface: usize, corner: usize, x: f64, y: f64) -> bool {
    // Clamp values to valid range
    let x = x.clamp(0.0, 1.0);
    let y = y.clamp(0.0, 1.0);

    match config.surfaces.get_mut(surface) {
        Some(cfg) if corner < 4 => {
            cfg.vertices.corners[corner] = Point::new(x, y);
            true
        }
        _ => {
            tracing::warn!("Invalid vertex: surface {} corner {}", surface, corner);
            false
        }
    }
}

/// Put a surface's vertices back on the full output
pub fn reset_vertices(config: &mut Config, surface: usize) -> bool {
    match config.surfaces.get_mut(surface) {
        Some(cfg) => {
            cfg.vertices = Quad::UNIT;
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_points_count() {
        let config = Config::default();
        let points = vertex_points(&config);
        // Two projector surfaces, four corners each; screens have no vertices
        assert_eq!(points.len(), 8);
        assert_eq!(points[4].surface, 1);
        assert_eq!(points[4].corner, 0);
        assert_eq!(points[4].label, "Top Left");
        assert_eq!(points[4].display, 2);
    }

    #[test]
    fn test_update_corner() {
        let mut config = Config::default();
        assert!(update_vertex(&mut config, 0, 2, 0.8, 0.9));
        assert_eq!(config.surfaces[0].vertices.corners[2], Point::new(0.8, 0.9));
    }

    #[test]
    fn test_invalid_vertex() {
        let mut config = Config::default();
        let before = config.surfaces.clone();
        assert!(!update_vertex(&mut config, 5, 0, 0.5, 0.5));
        assert!(!update_vertex(&mut config, 0, 4, 0.5, 0.5));
        assert_eq!(config.surfaces, before);
    }

    #[test]
    fn test_clamping() {
        let mut config = Config::default();
        update_vertex(&mut config, 1, 0, 1.5, -0.5);
        assert_eq!(config.surfaces[1].vertices.corners[0], Point::new(1.0, 0.0));
    }

    #[test]
    fn test_reset() {
        let mut config = Config::default();
        assert!(reset_vertices(&mut config, 0));
        assert_eq!(config.surfaces[0].vertices, Quad::UNIT);
        assert!(!reset_vertices(&mut config, 9));
    }
}
