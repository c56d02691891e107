//! cavewarp - projective geometry for multi-surface immersive displays
//!
//! Solves the per-surface quad-warp homographies and the head-tracked
//! off-axis projections a CAVE renderer needs every frame, and serves the
//! results together with a calibration API.

pub mod calibration;
pub mod config;
pub mod error;
pub mod frame;
pub mod homography;
pub mod preview;
pub mod projection;
pub mod server;
pub mod topology;
pub mod warp;

pub use error::{GeometryError, GeometryResult};
pub use homography::{compute_homography, Homography, Point, Quad};
pub use projection::{off_axis_projection, ProjectionParameters, SurfaceKind};
pub use warp::{compute_warp_transform, WarpCache};
