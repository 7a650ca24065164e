use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::camera::{Camera, Viewport};

/// Controls how the orbit camera moves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrbitMode {
    /// Camera stays where it was placed.
    #[default]
    Fixed,
    /// Camera auto-rotates around the target.
    AutoRotate {
        /// Rotation speed in radians per second (positive = counterclockwise from above).
        speed: f32,
    },
}

/// A camera controller that orbits around a target point.
///
/// # Example
/// ```
/// use kbuffer::{OrbitCamera, OrbitMode, Viewport, Vec3};
///
/// let mut orbit = OrbitCamera::new()
///     .target(Vec3::new(0.0, 0.5, 0.0))
///     .distance(3.0)
///     .mode(OrbitMode::AutoRotate { speed: 0.3 });
///
/// orbit.update(1.0 / 60.0);
/// let camera = orbit.camera(Viewport::full(800, 600));
/// assert!(((camera.position - orbit.target).length() - 3.0).abs() < 1e-4);
/// ```
#[derive(Clone, Debug)]
pub struct OrbitCamera {
    /// Point the camera orbits around.
    pub target: Vec3,
    /// Distance from target.
    pub distance: f32,
    /// Horizontal angle in radians (yaw).
    pub azimuth: f32,
    /// Vertical angle in radians (pitch), clamped away from the poles.
    pub elevation: f32,
    /// Field of view in radians.
    pub fov: f32,
    pub near: f32,
    pub far: f32,
    pub mode: OrbitMode,
}

impl Default for OrbitCamera {
    fn default() -> Self {
        Self {
            target: Vec3::ZERO,
            distance: 5.0,
            azimuth: 0.0,
            elevation: 0.0,
            fov: 60f32.to_radians(),
            near: 0.1,
            far: 100.0,
            mode: OrbitMode::Fixed,
        }
    }
}

const ELEVATION_LIMIT: f32 = std::f32::consts::FRAC_PI_2 - 0.01;

impl OrbitCamera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(mut self, target: impl Into<Vec3>) -> Self {
        self.target = target.into();
        self
    }

    pub fn distance(mut self, distance: f32) -> Self {
        self.distance = distance.max(f32::EPSILON);
        self
    }

    pub fn mode(mut self, mode: OrbitMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the field of view in degrees.
    pub fn fov(mut self, fov_degrees: f32) -> Self {
        self.fov = fov_degrees.to_radians();
        self
    }

    pub fn azimuth(mut self, azimuth: f32) -> Self {
        self.azimuth = azimuth;
        self
    }

    pub fn elevation(mut self, elevation: f32) -> Self {
        self.elevation = elevation.clamp(-ELEVATION_LIMIT, ELEVATION_LIMIT);
        self
    }

    pub fn clip(mut self, near: f32, far: f32) -> Self {
        self.near = near;
        self.far = far;
        self
    }

    /// Advances the orbit by `dt` seconds.
    pub fn update(&mut self, dt: f32) {
        if let OrbitMode::AutoRotate { speed } = self.mode {
            self.azimuth += speed * dt;
        }
    }

    /// Camera looking at the target from the current orbit position.
    pub fn camera(&self, viewport: Viewport) -> Camera {
        // Spherical to Cartesian conversion
        let offset = Vec3::new(
            self.distance * self.elevation.cos() * self.azimuth.sin(),
            self.distance * self.elevation.sin(),
            self.distance * self.elevation.cos() * self.azimuth.cos(),
        );

        Camera {
            position: self.target + offset,
            forward: (-offset).normalize_or(Vec3::NEG_Z),
            up: Vec3::Y,
            projection: crate::camera::Projection::Perspective { fov_y: self.fov },
            near: self.near,
            far: self.far,
            viewport,
        }
    }
}
