//! Off-axis (asymmetric frustum) projection for head-tracked surfaces
//!
//! Every surface gets a symmetric perspective built from the head's distance
//! to the surface plane, then skewed off-axis by the head's lateral offset.
//! Projector surfaces and screens are oriented differently in their local
//! frames, so each has its own field-of-view and obliqueness function.
//!
//! Matrices are row-major in the usual OpenGL clip convention (camera looks
//! down -Z, NDC in [-1, 1]).

use nalgebra::{Matrix4, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{GeometryError, GeometryResult};

/// Smallest scaled distance or extent treated as non-zero
const DISTANCE_EPSILON: f64 = 1e-9;

/// Which sign and axis convention a surface follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceKind {
    /// Projected plane: normal along local Y, vertical extent along local Z
    Projector,
    /// Flat panel: normal along local Z (viewed from -Z), vertical extent along local Y
    Screen,
}

/// World-space midpoints of a surface rectangle's four edges
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceEdges {
    pub top: Vector3<f64>,
    pub right: Vector3<f64>,
    pub bottom: Vector3<f64>,
    pub left: Vector3<f64>,
}

impl SurfaceEdges {
    pub fn new(
        top: Vector3<f64>,
        right: Vector3<f64>,
        bottom: Vector3<f64>,
        left: Vector3<f64>,
    ) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    /// Edge midpoints of a rectangle given as top-left, top-right, bottom-right, bottom-left
    pub fn from_corners(corners: [Vector3<f64>; 4]) -> Self {
        let [tl, tr, br, bl] = corners;
        Self {
            top: (tl + tr) * 0.5,
            right: (tr + br) * 0.5,
            bottom: (br + bl) * 0.5,
            left: (bl + tl) * 0.5,
        }
    }

    pub fn bottom_to_top(&self) -> Vector3<f64> {
        self.top - self.bottom
    }

    pub fn left_to_right(&self) -> Vector3<f64> {
        self.right - self.left
    }

    /// Half width and half height, rejecting zero-sized surfaces
    pub fn half_extents(&self) -> GeometryResult<(f64, f64)> {
        let half_width = self.left_to_right().norm() / 2.0;
        let half_height = self.bottom_to_top().norm() / 2.0;
        if !(half_width > DISTANCE_EPSILON && half_height > DISTANCE_EPSILON)
            || !half_width.is_finite()
            || !half_height.is_finite()
        {
            return Err(GeometryError::DegenerateQuad);
        }
        Ok((half_width, half_height))
    }

    pub fn aspect(&self) -> GeometryResult<f64> {
        let (half_width, half_height) = self.half_extents()?;
        Ok(half_width / half_height)
    }
}

/// The tracked head seen from one surface
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewerPlacement {
    /// Head position in the surface's local frame
    pub head_local: Vector3<f64>,
    /// Accumulated scale of the surface's frame relative to world space
    pub ancestor_scale: Vector3<f64>,
}

impl ViewerPlacement {
    pub fn new(head_local: Vector3<f64>, ancestor_scale: Vector3<f64>) -> Self {
        Self {
            head_local,
            ancestor_scale,
        }
    }

    /// Head offset in world units along each local axis
    pub fn scaled_offset(&self) -> Vector3<f64> {
        self.head_local.component_mul(&self.ancestor_scale)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClipPlanes {
    pub near: f64,
    pub far: f64,
}

impl ClipPlanes {
    pub fn new(near: f64, far: f64) -> Self {
        Self { near, far }
    }

    pub fn validate(&self) -> GeometryResult<()> {
        let finite = self.near.is_finite() && self.far.is_finite();
        let valid = finite && self.near > 0.0 && self.far > self.near;
        if valid {
            Ok(())
        } else {
            Err(GeometryError::InvalidClipPlanes {
                near: self.near,
                far: self.far,
            })
        }
    }
}

impl Default for ClipPlanes {
    fn default() -> Self {
        Self {
            near: 0.05,
            far: 1000.0,
        }
    }
}

/// Skew terms written into a perspective matrix, already signed for their variant
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Obliqueness {
    pub horizontal: f64,
    pub vertical: f64,
}

/// Per-surface values derived every frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProjectionParameters {
    /// Vertical field of view in degrees
    pub fov_degrees: f64,
    pub oblique_horizontal: f64,
    pub oblique_vertical: f64,
    pub aspect: f64,
    pub near: f64,
    pub far: f64,
}

impl ProjectionParameters {
    pub fn obliqueness(&self) -> Obliqueness {
        Obliqueness {
            horizontal: self.oblique_horizontal,
            vertical: self.oblique_vertical,
        }
    }

    pub fn clip(&self) -> ClipPlanes {
        ClipPlanes::new(self.near, self.far)
    }

    /// Symmetric perspective with the skew terms applied
    pub fn matrix(&self) -> GeometryResult<Matrix4<f64>> {
        let mut matrix = perspective(self.fov_degrees, self.aspect, self.clip())?;
        apply_obliqueness(&mut matrix, self.obliqueness());
        Ok(matrix)
    }
}

fn nonzero_depth(depth: f64) -> GeometryResult<f64> {
    if !depth.is_finite() || depth.abs() < DISTANCE_EPSILON {
        return Err(GeometryError::ZeroDistance { depth });
    }
    Ok(depth)
}

/// Field of view for a projector surface: depth along local Y
pub fn projector_field_of_view(
    edges: &SurfaceEdges,
    placement: &ViewerPlacement,
) -> GeometryResult<f64> {
    let (_, half_height) = edges.half_extents()?;
    let depth = nonzero_depth(placement.head_local.y * placement.ancestor_scale.y)?;
    Ok(2.0 * (half_height / depth).atan().to_degrees())
}

/// Field of view for a screen: depth along local Z, negated since screens
/// are viewed from their local -Z side
pub fn screen_field_of_view(
    edges: &SurfaceEdges,
    placement: &ViewerPlacement,
) -> GeometryResult<f64> {
    let (_, half_height) = edges.half_extents()?;
    let depth = nonzero_depth(placement.head_local.z * placement.ancestor_scale.z)?;
    Ok(-2.0 * (half_height / depth).atan().to_degrees())
}

/// Obliqueness for a projector surface: vertical offset along local Z
pub fn projector_obliqueness(
    edges: &SurfaceEdges,
    placement: &ViewerPlacement,
) -> GeometryResult<Obliqueness> {
    let (half_width, half_height) = edges.half_extents()?;
    let offset = placement.scaled_offset();
    Ok(Obliqueness {
        horizontal: offset.x / half_width,
        vertical: offset.z / half_height,
    })
}

/// Obliqueness for a screen: vertical offset along local Y, both terms negated
pub fn screen_obliqueness(
    edges: &SurfaceEdges,
    placement: &ViewerPlacement,
) -> GeometryResult<Obliqueness> {
    let (half_width, half_height) = edges.half_extents()?;
    let offset = placement.scaled_offset();
    Ok(Obliqueness {
        horizontal: -(offset.x / half_width),
        vertical: -(offset.y / half_height),
    })
}

/// Symmetric OpenGL-style perspective matrix
#[rustfmt::skip]
pub fn perspective(
    fov_degrees: f64,
    aspect: f64,
    clip: ClipPlanes,
) -> GeometryResult<Matrix4<f64>> {
    clip.validate()?;
    let f = 1.0 / (fov_degrees.to_radians() / 2.0).tan();
    let ClipPlanes { near, far } = clip;

    Ok(Matrix4::new(
        f / aspect, 0.0, 0.0, 0.0,
        0.0, f, 0.0, 0.0,
        0.0, 0.0, (far + near) / (near - far), 2.0 * far * near / (near - far),
        0.0, 0.0, -1.0, 0.0,
    ))
}

/// Shear X and Y as a function of depth, turning a symmetric frustum off-axis
pub fn apply_obliqueness(matrix: &mut Matrix4<f64>, obliqueness: Obliqueness) {
    matrix[(0, 2)] = obliqueness.horizontal;
    matrix[(1, 2)] = obliqueness.vertical;
}

pub fn projection_parameters(
    kind: SurfaceKind,
    edges: &SurfaceEdges,
    placement: &ViewerPlacement,
    clip: ClipPlanes,
) -> GeometryResult<ProjectionParameters> {
    clip.validate()?;
    let (fov_degrees, obliqueness) = match kind {
        SurfaceKind::Projector => (
            projector_field_of_view(edges, placement)?,
            projector_obliqueness(edges, placement)?,
        ),
        SurfaceKind::Screen => (
            screen_field_of_view(edges, placement)?,
            screen_obliqueness(edges, placement)?,
        ),
    };

    Ok(ProjectionParameters {
        fov_degrees,
        oblique_horizontal: obliqueness.horizontal,
        oblique_vertical: obliqueness.vertical,
        aspect: edges.aspect()?,
        near: clip.near,
        far: clip.far,
    })
}

pub fn off_axis_projection(
    kind: SurfaceKind,
    edges: &SurfaceEdges,
    placement: &ViewerPlacement,
    clip: ClipPlanes,
) -> GeometryResult<Matrix4<f64>> {
    projection_parameters(kind, edges, placement, clip)?.matrix()
}

/// Projection of a physical projector lens; `lens_shift` is its vertical offset
pub fn projector_lens_projection(
    fov_degrees: f64,
    aspect: f64,
    lens_shift: f64,
    clip: ClipPlanes,
) -> GeometryResult<Matrix4<f64>> {
    let mut matrix = perspective(fov_degrees, aspect, clip)?;
    apply_obliqueness(
        &mut matrix,
        Obliqueness {
            horizontal: 0.0,
            vertical: lens_shift,
        },
    );
    Ok(matrix)
}

/// Row-major copy of a 4x4 matrix
pub fn matrix_rows(m: &Matrix4<f64>) -> [[f64; 4]; 4] {
    let mut rows = [[0.0; 4]; 4];
    for (r, row) in rows.iter_mut().enumerate() {
        for (c, value) in row.iter_mut().enumerate() {
            *value = m[(r, c)];
        }
    }
    rows
}
