//! Errors raised by the projective geometry core

pub type GeometryResult<T> = Result<T, GeometryError>;

/// A per-call geometry failure. None of these have a fallback value: the
/// caller decides whether to skip the affected surface for the frame.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum GeometryError {
    #[error("degenerate quad: corners are collinear or defining edges are parallel")]
    DegenerateQuad,

    #[error("transform is not invertible (determinant {determinant:e})")]
    SingularTransform { determinant: f64 },

    #[error("head lies on the surface plane (scaled depth offset {depth})")]
    ZeroDistance { depth: f64 },

    #[error("invalid clip planes: near {near}, far {far}")]
    InvalidClipPlanes { near: f64, far: f64 },
}
