//! Surface and display topology
//!
//! Resolves the installation description into flat, world-space records the
//! geometry core can consume directly. Every element hangs off a single root
//! frame scaled by `kave_scale`:
//!
//! `world = kave_scale * (position + R * (scale ∘ local))`
//!
//! Projector surfaces are 10x10 planes in their local XZ plane, turned an
//! extra 180° about local Y. Screens are unit quads in their local XY plane.

use anyhow::Result;
use nalgebra::{Isometry3, Matrix4, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::config::{Config, Vec3};
use crate::error::GeometryResult;
use crate::homography::{Homography, Quad};
use crate::projection::{
    projection_parameters, projector_lens_projection, ClipPlanes, ProjectionParameters,
    SurfaceEdges, SurfaceKind, ViewerPlacement,
};
use crate::warp::WarpCache;

/// Half the side of the plane mesh used for projector surfaces
const PLANE_HALF_EXTENT: f64 = 5.0;
const PLANE_UNITS: f64 = 2.0 * PLANE_HALF_EXTENT;
/// Half the side of the quad mesh used for screens
const QUAD_HALF_EXTENT: f64 = 0.5;

/// Euler angles in degrees, applied about Z, then X, then Y
pub fn euler_rotation(degrees: Vec3) -> UnitQuaternion<f64> {
    let x = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), degrees.x.to_radians());
    let y = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), degrees.y.to_radians());
    let z = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), degrees.z.to_radians());
    y * x * z
}

/// World-space head position, sampled once per frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackedHead {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl TrackedHead {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn from_vector(v: Vector3<f64>) -> Self {
        Self::new(v.x, v.y, v.z)
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }
}

impl Default for TrackedHead {
    fn default() -> Self {
        Self::new(0.0, 1.6, 0.0)
    }
}

/// A rendering target with all geometry already resolved to world space
#[derive(Debug, Clone, PartialEq)]
pub struct Surface {
    pub id: usize,
    pub kind: SurfaceKind,
    /// Zero-based physical output
    pub display: usize,
    /// Bumped whenever the surface's quads change; keys the warp cache
    pub version: u64,
    pub position: Vector3<f64>,
    pub rotation: UnitQuaternion<f64>,
    /// Scale of the surface frame relative to world space
    pub scale: Vector3<f64>,
    pub edges: SurfaceEdges,
    /// Where the surface lands in its display's output (normalized)
    pub render_quad: Quad,
    /// Sampled region of the surface's offscreen image
    pub reference_quad: Quad,
}

impl Surface {
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: usize,
        kind: SurfaceKind,
        display: usize,
        position: Vector3<f64>,
        rotation: UnitQuaternion<f64>,
        scale: Vector3<f64>,
        render_quad: Quad,
        reference_quad: Quad,
    ) -> Self {
        let half = match kind {
            SurfaceKind::Projector => PLANE_HALF_EXTENT,
            SurfaceKind::Screen => QUAD_HALF_EXTENT,
        };
        let (vertical, horizontal) = match kind {
            SurfaceKind::Projector => (Vector3::z(), Vector3::x()),
            SurfaceKind::Screen => (Vector3::y(), Vector3::x()),
        };
        let to_world = |local: Vector3<f64>| position + rotation * local.component_mul(&scale);
        let edges = SurfaceEdges::new(
            to_world(vertical * half),
            to_world(horizontal * half),
            to_world(-vertical * half),
            to_world(-horizontal * half),
        );

        Self {
            id,
            kind,
            display,
            version: 0,
            position,
            rotation,
            scale,
            edges,
            render_quad,
            reference_quad,
        }
    }

    /// The head in this surface's local frame
    pub fn placement(&self, head: &TrackedHead) -> ViewerPlacement {
        let offset = self
            .rotation
            .inverse_transform_vector(&(head.position() - self.position));
        ViewerPlacement::new(offset.component_div(&self.scale), self.scale)
    }

    pub fn projection(
        &self,
        head: &TrackedHead,
        clip: ClipPlanes,
    ) -> GeometryResult<ProjectionParameters> {
        projection_parameters(self.kind, &self.edges, &self.placement(head), clip)
    }

    /// Orientation of the viewer camera for this surface (camera looks down its local +Z)
    pub fn camera_rotation(&self) -> UnitQuaternion<f64> {
        match self.kind {
            SurfaceKind::Projector => self.rotation * euler_rotation(Vec3::new(90.0, 180.0, 0.0)),
            SurfaceKind::Screen => self.rotation,
        }
    }

    /// World-to-camera matrix for a camera at the head, looking down -Z in view space
    pub fn view_matrix(&self, head: &TrackedHead) -> Matrix4<f64> {
        camera_view(head.position(), self.camera_rotation())
    }

    pub fn warp(&self, cache: &WarpCache) -> GeometryResult<Homography> {
        cache.get_or_compute(self.id, self.version, &self.reference_quad, &self.render_quad)
    }
}

fn camera_view(position: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Matrix4<f64> {
    let camera = Isometry3::from_parts(Translation3::from(position), rotation);
    let flip = Matrix4::new_nonuniform_scaling(&Vector3::new(1.0, 1.0, -1.0));
    flip * camera.inverse().to_homogeneous()
}

/// A physical projector and the surfaces it warps onto its output
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectorRig {
    /// Zero-based physical output
    pub display: usize,
    pub position: Vector3<f64>,
    pub rotation: UnitQuaternion<f64>,
    pub fov_degrees: f64,
    pub lens_shift: f64,
    pub aspect: f64,
    pub clip: ClipPlanes,
    /// Ids of the surfaces drawn by this projector
    pub surfaces: Vec<usize>,
}

impl ProjectorRig {
    pub fn projection(&self) -> GeometryResult<Matrix4<f64>> {
        projector_lens_projection(self.fov_degrees, self.aspect, self.lens_shift, self.clip)
    }

    pub fn view_matrix(&self) -> Matrix4<f64> {
        camera_view(self.position, self.rotation)
    }
}

/// The resolved installation
#[derive(Debug, Clone)]
pub struct Topology {
    /// Incremented on every rebuild
    pub revision: u64,
    pub kave_scale: f64,
    pub clip: ClipPlanes,
    /// Width over height of the offscreen surface images
    pub texture_aspect: f64,
    surfaces: Vec<Surface>,
    projectors: Vec<ProjectorRig>,
    sensor_position: Vector3<f64>,
    sensor_rotation: UnitQuaternion<f64>,
    rest_head: TrackedHead,
}

impl Topology {
    /// Resolve `config`. Surfaces whose quads are unchanged since `previous`
    /// keep their version so their cached warp stays valid.
    pub fn from_config(config: &Config, previous: Option<&Topology>) -> Result<Self> {
        config.validate()?;

        let k = config.kave_scale;
        let flip = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), std::f64::consts::PI);
        let mut surfaces = Vec::with_capacity(config.surfaces.len() + config.screens.len());

        for surface in &config.surfaces {
            surfaces.push(Surface::new(
                surfaces.len(),
                SurfaceKind::Projector,
                surface.display - 1,
                surface.position.to_vector() * k,
                euler_rotation(surface.rotation) * flip,
                surface.size.to_vector() * (k / PLANE_UNITS),
                surface.vertices,
                surface.reference,
            ));
        }
        for screen in &config.screens {
            surfaces.push(Surface::new(
                surfaces.len(),
                SurfaceKind::Screen,
                screen.display - 1,
                screen.position.to_vector() * k,
                euler_rotation(screen.rotation),
                screen.size.to_vector() * k,
                Quad::UNIT,
                Quad::UNIT,
            ));
        }

        for surface in &mut surfaces {
            surface.version = previous
                .and_then(|p| p.surface(surface.id))
                .map(|old| {
                    let unchanged = old.kind == surface.kind
                        && old.render_quad == surface.render_quad
                        && old.reference_quad == surface.reference_quad;
                    if unchanged {
                        old.version
                    } else {
                        old.version + 1
                    }
                })
                .unwrap_or(0);
        }

        let clip = config.render.clip_planes();
        let projectors = config
            .projectors
            .iter()
            .map(|projector| {
                let display = projector.display - 1;
                let position = projector.position.to_vector() * k;
                let on_display: Vec<usize> = surfaces
                    .iter()
                    .filter(|s| s.kind == SurfaceKind::Projector && s.display == display)
                    .map(|s| s.id)
                    .collect();

                // Far plane reaches twice as far as the surface it lights
                let far = on_display
                    .first()
                    .map(|&id| (surfaces[id].position - position).norm() * 2.0)
                    .filter(|far| *far > clip.near)
                    .unwrap_or(clip.far);

                let aspect = projector
                    .resolution
                    .map(|r| r.width as f64 / r.height as f64)
                    .unwrap_or_else(|| config.render.texture_aspect());

                ProjectorRig {
                    display,
                    position,
                    rotation: euler_rotation(projector.rotation),
                    fov_degrees: projector.fov,
                    lens_shift: projector.lens_shift,
                    aspect,
                    clip: ClipPlanes::new(clip.near, far),
                    surfaces: on_display,
                }
            })
            .collect();

        Ok(Self {
            revision: previous.map(|p| p.revision + 1).unwrap_or(0),
            kave_scale: k,
            clip,
            texture_aspect: config.render.texture_aspect(),
            surfaces,
            projectors,
            sensor_position: config.sensor.position.to_vector(),
            sensor_rotation: euler_rotation(config.sensor.rotation),
            rest_head: TrackedHead::from_vector(config.sensor.rest_position.to_vector()),
        })
    }

    pub fn surfaces(&self) -> &[Surface] {
        &self.surfaces
    }

    pub fn surface(&self, id: usize) -> Option<&Surface> {
        self.surfaces.get(id)
    }

    pub fn projectors(&self) -> &[ProjectorRig] {
        &self.projectors
    }

    pub fn surfaces_on_display(&self, display: usize) -> impl Iterator<Item = &Surface> {
        self.surfaces.iter().filter(move |s| s.display == display)
    }

    /// Number of physical outputs referenced by the installation
    pub fn display_count(&self) -> usize {
        let surfaces = self.surfaces.iter().map(|s| s.display);
        let projectors = self.projectors.iter().map(|p| p.display);
        surfaces.chain(projectors).max().map(|d| d + 1).unwrap_or(0)
    }

    /// Head position used before the tracker reports one
    pub fn rest_head(&self) -> TrackedHead {
        self.rest_head
    }

    /// Map a position reported in the tracker's frame into world space
    pub fn head_from_sensor(&self, sensor_local: Vector3<f64>) -> TrackedHead {
        let world = (self.sensor_position + self.sensor_rotation * sensor_local) * self.kave_scale;
        TrackedHead::from_vector(world)
    }
}
