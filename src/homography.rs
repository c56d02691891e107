//! Planar homography solver for quad-warp correction
//!
//! A homography here always maps the canonical unit square onto an arbitrary
//! four-corner quad: (0,0) to top-left, (1,0) to top-right, (1,1) to
//! bottom-right and (0,1) to bottom-left.

use nalgebra::{Matrix3, Matrix4, Vector3};
use serde::{Deserialize, Serialize};
use std::ops::Mul;

use crate::error::{GeometryError, GeometryResult};

/// Sine of the smallest corner angle accepted before a quad counts as degenerate.
pub const DEGENERACY_EPSILON: f64 = 1e-9;

/// Smallest homogeneous w accepted when projecting a point
const W_EPSILON: f64 = 1e-10;

/// Smallest accepted ratio of `|det|` to the product of the column norms.
/// The ratio does not change when a column is scaled, so tiny quads stay invertible.
const SINGULAR_EPSILON: f64 = 1e-12;

/// A 2D point, usually in normalized display coordinates (0.0 to 1.0, origin top-left)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn minus(self, other: Point) -> (f64, f64) {
        (self.x - other.x, self.y - other.y)
    }
}

/// Four corners in top-left, top-right, bottom-right, bottom-left order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Quad {
    pub corners: [Point; 4],
}

impl Quad {
    /// The canonical unit square, also the full frame in normalized display space
    pub const UNIT: Quad = Quad {
        corners: [
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(0.0, 1.0),
        ],
    };

    pub const fn new(
        top_left: Point,
        top_right: Point,
        bottom_right: Point,
        bottom_left: Point,
    ) -> Self {
        Self {
            corners: [top_left, top_right, bottom_right, bottom_left],
        }
    }

    pub fn top_left(&self) -> Point {
        self.corners[0]
    }

    pub fn top_right(&self) -> Point {
        self.corners[1]
    }

    pub fn bottom_right(&self) -> Point {
        self.corners[2]
    }

    pub fn bottom_left(&self) -> Point {
        self.corners[3]
    }

    /// Reject quads where any three cyclically consecutive corners are collinear.
    /// With four corners every triple is consecutive, so this covers all of them.
    pub fn validate(&self) -> GeometryResult<()> {
        for i in 0..4 {
            let a = self.corners[i];
            let b = self.corners[(i + 1) % 4];
            let c = self.corners[(i + 2) % 4];
            let (e1x, e1y) = b.minus(a);
            let (e2x, e2y) = c.minus(b);
            let len1 = e1x.hypot(e1y);
            let len2 = e2x.hypot(e2y);
            if len1 <= f64::EPSILON || len2 <= f64::EPSILON {
                return Err(GeometryError::DegenerateQuad);
            }
            let cross = e1x * e2y - e1y * e2x;
            if cross.abs() <= DEGENERACY_EPSILON * len1 * len2 {
                return Err(GeometryError::DegenerateQuad);
            }
        }
        Ok(())
    }

    /// Homography mapping the unit square onto this quad
    pub fn homography(&self) -> GeometryResult<Homography> {
        compute_homography(
            self.top_left(),
            self.top_right(),
            self.bottom_right(),
            self.bottom_left(),
        )
    }

    /// Even-odd containment test, valid for concave quads as well
    pub fn contains(&self, p: Point) -> bool {
        let mut inside = false;
        let mut j = 3;
        for i in 0..4 {
            let a = self.corners[i];
            let b = self.corners[j];
            if (a.y > p.y) != (b.y > p.y) {
                let x_cross = (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x;
                if p.x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

impl Default for Quad {
    fn default() -> Self {
        Self::UNIT
    }
}

/// Planar projective transform (3x3, last row `(g, h, 1)` when solved from a quad)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    matrix: Matrix3<f64>,
}

impl Homography {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
        }
    }

    pub fn from_matrix(matrix: Matrix3<f64>) -> Self {
        Self { matrix }
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// Row-major copy of the matrix
    pub fn rows(&self) -> [[f64; 3]; 3] {
        let m = &self.matrix;
        [
            [m[(0, 0)], m[(0, 1)], m[(0, 2)]],
            [m[(1, 0)], m[(1, 1)], m[(1, 2)]],
            [m[(2, 0)], m[(2, 1)], m[(2, 2)]],
        ]
    }

    /// The 4x4 layout quad-warp shaders expect: homography in the upper-left
    /// 3x3 block, `m33 = 1`, everything else zero.
    #[rustfmt::skip]
    pub fn to_shader_matrix(&self) -> Matrix4<f64> {
        let m = &self.matrix;
        Matrix4::new(
            m[(0, 0)], m[(0, 1)], m[(0, 2)], 0.0,
            m[(1, 0)], m[(1, 1)], m[(1, 2)], 0.0,
            m[(2, 0)], m[(2, 1)], m[(2, 2)], 0.0,
            0.0, 0.0, 0.0, 1.0,
        )
    }

    /// Apply as a homogeneous 2D transform. `None` when the point maps to infinity.
    #[inline]
    pub fn transform_point(&self, p: Point) -> Option<Point> {
        let v = self.matrix * Vector3::new(p.x, p.y, 1.0);
        let w = v[2];
        if !w.is_finite() || w.abs() < W_EPSILON {
            return None;
        }
        Some(Point::new(v[0] / w, v[1] / w))
    }

    pub fn try_inverse(&self) -> GeometryResult<Homography> {
        let determinant = self.matrix.determinant();
        let column_norms: f64 = self.matrix.column_iter().map(|c| c.norm()).product();
        let singular = !determinant.is_finite()
            || column_norms == 0.0
            || determinant.abs() <= SINGULAR_EPSILON * column_norms;
        if singular {
            return Err(GeometryError::SingularTransform { determinant });
        }
        self.matrix
            .try_inverse()
            .filter(|inverse| inverse.iter().all(|v| v.is_finite()))
            .map(Homography::from_matrix)
            .ok_or(GeometryError::SingularTransform { determinant })
    }
}

impl Default for Homography {
    fn default() -> Self {
        Self::identity()
    }
}

impl Mul for Homography {
    type Output = Homography;

    fn mul(self, rhs: Homography) -> Homography {
        Homography::from_matrix(self.matrix * rhs.matrix)
    }
}

/// Solve the homography taking the unit square onto the given quad.
///
/// Closed-form square-to-quad solution; the quad is checked for collinear
/// corners first so a singular system is reported instead of producing
/// non-finite entries.
pub fn compute_homography(
    top_left: Point,
    top_right: Point,
    bottom_right: Point,
    bottom_left: Point,
) -> GeometryResult<Homography> {
    Quad::new(top_left, top_right, bottom_right, bottom_left).validate()?;

    let sx = (top_left.x - top_right.x) + (bottom_right.x - bottom_left.x);
    let sy = (top_left.y - top_right.y) + (bottom_right.y - bottom_left.y);

    let dx1 = top_right.x - bottom_right.x;
    let dx2 = bottom_left.x - bottom_right.x;
    let dy1 = top_right.y - bottom_right.y;
    let dy2 = bottom_left.y - bottom_right.y;

    let z = dx1 * dy2 - dy1 * dx2;
    if z.abs() <= DEGENERACY_EPSILON * dx1.hypot(dy1) * dx2.hypot(dy2) {
        return Err(GeometryError::DegenerateQuad);
    }
    let g = (sx * dy2 - sy * dx2) / z;
    let h = (sy * dx1 - sx * dy1) / z;

    let matrix = Matrix3::new(
        top_right.x - top_left.x + g * top_right.x,
        bottom_left.x - top_left.x + h * bottom_left.x,
        top_left.x,
        top_right.y - top_left.y + g * top_right.y,
        bottom_left.y - top_left.y + h * bottom_left.y,
        top_left.y,
        g,
        h,
        1.0,
    );

    Ok(Homography { matrix })
}
