//! Installation configuration for cavewarp

use anyhow::{bail, Context, Result};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::homography::{Point, Quad};
use crate::projection::ClipPlanes;

/// A 3D vector in installation units (positions, Euler angles in degrees, sizes)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn to_vector(self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    fn has_zero_component(&self) -> bool {
        self.x == 0.0 || self.y == 0.0 || self.z == 0.0
    }
}

/// Head tracking hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Skeletal tracker (head joint)
    #[default]
    Kinect,
    /// Marker-based optical tracker (rigid body)
    ArtTrack,
}

/// Pose of the tracker inside the installation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorConfig {
    /// Tracker model, passed on to the tracking bridge that feeds `/api/head`
    #[serde(default)]
    pub kind: SensorKind,
    #[serde(default)]
    pub position: Vec3,
    /// Euler angles in degrees
    #[serde(default)]
    pub rotation: Vec3,
    /// Tracked body for marker-based trackers, read by the tracking bridge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_id: Option<u32>,
    /// World-space head position used until the tracker reports one
    #[serde(default = "default_rest_position")]
    pub rest_position: Vec3,
}

fn default_rest_position() -> Vec3 {
    Vec3::new(0.0, 1.6, 0.0)
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            kind: SensorKind::default(),
            position: Vec3::default(),
            rotation: Vec3::default(),
            body_id: None,
            rest_position: default_rest_position(),
        }
    }
}

/// A projected wall or floor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SurfaceConfig {
    /// Physical output (1-based, as labelled on the host)
    pub display: usize,
    pub position: Vec3,
    /// Euler angles in degrees
    pub rotation: Vec3,
    /// Width along X, thickness along Y, height along Z
    pub size: Vec3,
    /// Where the surface lands in its projector's output, normalized display coordinates.
    /// Order: top-left, top-right, bottom-right, bottom-left
    #[serde(default)]
    pub vertices: Quad,
    /// Region of the surface's offscreen image that is sampled
    #[serde(default)]
    pub reference: Quad,
}

/// A directly viewed flat panel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreenConfig {
    /// Physical output (1-based)
    pub display: usize,
    pub position: Vec3,
    /// Euler angles in degrees
    pub rotation: Vec3,
    /// Width along X, height along Y, depth along Z
    pub size: Vec3,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// A physical projector
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectorConfig {
    /// Physical output (1-based)
    pub display: usize,
    pub position: Vec3,
    /// Euler angles in degrees
    pub rotation: Vec3,
    /// Vertical field of view of the lens, degrees
    pub fov: f64,
    /// Vertical lens shift
    #[serde(default)]
    pub lens_shift: f64,
    /// Native output resolution, used for the lens aspect ratio
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

/// Render loop configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderConfig {
    pub fps: u32,
    /// Offscreen texture size per surface
    pub texture_width: u32,
    pub texture_height: u32,
    pub near_clip: f64,
    pub far_clip: f64,
    /// Size of the warp previews served by the API
    pub preview_width: u32,
    pub preview_height: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            fps: 60,
            texture_width: 2800,
            texture_height: 1050,
            near_clip: 0.05,
            far_clip: 1000.0,
            preview_width: 640,
            preview_height: 360,
        }
    }
}

impl RenderConfig {
    pub fn clip_planes(&self) -> ClipPlanes {
        ClipPlanes::new(self.near_clip, self.far_clip)
    }

    pub fn texture_aspect(&self) -> f64 {
        self.texture_width as f64 / self.texture_height as f64
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8092,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Installation units per world unit. A 2 m wall with a scale of 3 spans 6 world units.
    #[serde(default = "default_kave_scale")]
    pub kave_scale: f64,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub render: RenderConfig,

    #[serde(default)]
    pub sensor: SensorConfig,

    #[serde(default)]
    pub surfaces: Vec<SurfaceConfig>,

    #[serde(default)]
    pub projectors: Vec<ProjectorConfig>,

    #[serde(default)]
    pub screens: Vec<ScreenConfig>,
}

fn default_kave_scale() -> f64 {
    1.0
}

impl Default for Config {
    /// Front wall and floor, each with its own projector, plus a side screen
    fn default() -> Self {
        let inset = Quad::new(
            Point::new(0.02, 0.02),
            Point::new(0.98, 0.02),
            Point::new(0.98, 0.98),
            Point::new(0.02, 0.98),
        );

        Self {
            kave_scale: default_kave_scale(),
            server: ServerConfig::default(),
            render: RenderConfig::default(),
            sensor: SensorConfig::default(),
            surfaces: vec![
                SurfaceConfig {
                    display: 1,
                    position: Vec3::new(0.0, 1.5, 1.5),
                    rotation: Vec3::new(-90.0, 0.0, 0.0),
                    size: Vec3::new(3.0, 1.0, 3.0),
                    vertices: inset,
                    reference: Quad::UNIT,
                },
                SurfaceConfig {
                    display: 2,
                    position: Vec3::new(0.0, 0.0, 0.0),
                    rotation: Vec3::new(0.0, 0.0, 0.0),
                    size: Vec3::new(3.0, 1.0, 3.0),
                    vertices: inset,
                    reference: Quad::UNIT,
                },
            ],
            projectors: vec![
                ProjectorConfig {
                    display: 1,
                    position: Vec3::new(0.0, 1.5, -2.5),
                    rotation: Vec3::new(0.0, 0.0, 0.0),
                    fov: 45.0,
                    lens_shift: 0.0,
                    resolution: Some(Resolution {
                        width: 1920,
                        height: 1080,
                    }),
                },
                ProjectorConfig {
                    display: 2,
                    position: Vec3::new(0.0, 3.2, 0.0),
                    rotation: Vec3::new(90.0, 0.0, 0.0),
                    fov: 55.0,
                    lens_shift: 0.0,
                    resolution: Some(Resolution {
                        width: 1920,
                        height: 1080,
                    }),
                },
            ],
            screens: vec![ScreenConfig {
                display: 3,
                position: Vec3::new(1.5, 1.2, 0.5),
                rotation: Vec3::new(0.0, 90.0, 0.0),
                size: Vec3::new(1.2, 0.7, 1.0),
            }],
        }
    }
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            config
                .validate()
                .with_context(|| format!("Invalid installation in {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory {:?}", parent))?;
            }
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Check the values the geometry depends on. Vertex quads are not checked
    /// here: a degenerate quad only disables its surface, frame by frame.
    pub fn validate(&self) -> Result<()> {
        if !(self.kave_scale.is_finite() && self.kave_scale > 0.0) {
            bail!("kave_scale must be positive, got {}", self.kave_scale);
        }
        if self.render.fps == 0 {
            bail!("render.fps must be at least 1");
        }
        if self.render.texture_width == 0 || self.render.texture_height == 0 {
            bail!("render texture size must be non-zero");
        }
        self.render
            .clip_planes()
            .validate()
            .context("Invalid render clip planes")?;

        for (index, surface) in self.surfaces.iter().enumerate() {
            check_display("surface", index, surface.display)?;
            check_placement("surface", index, &surface.position, &surface.rotation)?;
            check_size("surface", index, &surface.size)?;
        }
        for (index, screen) in self.screens.iter().enumerate() {
            check_display("screen", index, screen.display)?;
            check_placement("screen", index, &screen.position, &screen.rotation)?;
            check_size("screen", index, &screen.size)?;
        }
        for (index, projector) in self.projectors.iter().enumerate() {
            check_display("projector", index, projector.display)?;
            check_placement("projector", index, &projector.position, &projector.rotation)?;
            if !(projector.fov > 0.0 && projector.fov < 180.0) {
                bail!("projector {} has invalid fov {}", index, projector.fov);
            }
            if !projector.lens_shift.is_finite() {
                bail!("projector {} has invalid lens shift", index);
            }
            if let Some(resolution) = projector.resolution {
                if resolution.width == 0 || resolution.height == 0 {
                    bail!("projector {} has an empty resolution", index);
                }
            }
        }
        Ok(())
    }
}

fn check_display(what: &str, index: usize, display: usize) -> Result<()> {
    if display == 0 {
        bail!("{} {} has display 0; displays are numbered from 1", what, index);
    }
    Ok(())
}

fn check_placement(what: &str, index: usize, position: &Vec3, rotation: &Vec3) -> Result<()> {
    if !position.is_finite() || !rotation.is_finite() {
        bail!("{} {} has a non-finite position or rotation", what, index);
    }
    Ok(())
}

fn check_size(what: &str, index: usize, size: &Vec3) -> Result<()> {
    if !size.is_finite() || size.has_zero_component() {
        bail!("{} {} has invalid size {:?}", what, index, size);
    }
    Ok(())
}
