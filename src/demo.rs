//! The sample scene: an opaque yellow ground plane, a translucent model
//! tinted by thickness and a transparent magenta ball, seen by an orbiting
//! camera against a white background.

use std::f32::consts::FRAC_PI_2;
use std::path::{Path, PathBuf};

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::camera::{Camera, Viewport};
use crate::color::Color;
use crate::config::KBufferConfig;
use crate::drawable::MeshInstance;
use crate::geometry::{GeometryError, GeometryLoader};
use crate::gpu::GpuContext;
use crate::kbuffer::{FrameStats, KBuffer, MaterialRegistry};
use crate::material::StorePassMaterial;
use crate::mesh::{MeshData, Transform};
use crate::orbit_camera::{OrbitCamera, OrbitMode};
use crate::target::{ImageTarget, SnapshotError};

/// Tint reached by the model where it is at least `MODEL_MAX_THICKNESS` thick.
pub const MODEL_TINT: Color = Color::rgb(0.3, 0.7, 0.1);
pub const MODEL_MAX_THICKNESS: f32 = 0.02;
pub const BALL_ALPHA: f32 = 0.3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub background: Color,
    /// STL file for the translucent model; a cube when unset.
    pub model: Option<PathBuf>,
    /// Orbit speed in radians per second.
    pub orbit_speed: f32,
    /// Orbit elevation in radians.
    pub elevation: f32,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            background: Color::WHITE,
            model: None,
            orbit_speed: 0.3,
            elevation: 0.4,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SceneError {
    #[error("failed to load model: {0}")]
    Geometry(#[from] GeometryError),
    #[error("failed to write snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
}

pub struct DemoScene {
    pub registry: MaterialRegistry,
    pub plane: MeshInstance,
    pub model: MeshInstance,
    pub ball: MeshInstance,
    pub orbit: OrbitCamera,
    pub background: Color,
}

impl DemoScene {
    pub fn new(config: &SceneConfig) -> Result<Self, SceneError> {
        let registry = MaterialRegistry::new();

        let plane = MeshInstance::new(
            "plane",
            MeshData::plane(5.0),
            StorePassMaterial::new(&registry).base_color(Color::YELLOW),
        );

        let model_data = match &config.model {
            Some(path) => GeometryLoader::from_file(path)
                .centered()
                .normalized()
                .build()?,
            None => GeometryLoader::from_data(MeshData::cube())
                .scaled(0.5)
                .build()?,
        };
        let model = MeshInstance::new(
            "model",
            model_data,
            StorePassMaterial::new(&registry)
                .base_color(Color::BLACK)
                .translucent(MODEL_TINT, MODEL_MAX_THICKNESS),
        )
        .with_transform(
            Transform::new()
                .position(Vec3::new(0.75, 0.3, 0.0))
                .rotation(Quat::from_rotation_y(FRAC_PI_2)),
        );

        // Sphere resting on the plane.
        let mut ball_data = MeshData::sphere(32, 16);
        ball_data.translate(Vec3::new(0.0, 0.5, 0.0));
        let ball = MeshInstance::new(
            "ball",
            ball_data,
            StorePassMaterial::new(&registry).base_color(Color::MAGENTA.with_alpha(BALL_ALPHA)),
        )
        .with_transform(
            Transform::new()
                .position(Vec3::new(-0.75, 0.001, 0.0))
                .rotation(Quat::from_rotation_y(-FRAC_PI_2)),
        );

        let orbit = OrbitCamera::new()
            .target(Vec3::new(0.0, 0.5, 0.0))
            .distance(3.0)
            .elevation(config.elevation)
            .clip(1.0, 30.0)
            .mode(OrbitMode::AutoRotate {
                speed: config.orbit_speed,
            });

        log::info!("scene ready with {} materials", registry.count());
        Ok(Self {
            registry,
            plane,
            model,
            ball,
            orbit,
            background: config.background,
        })
    }

    pub fn drawables(&self) -> [&MeshInstance; 3] {
        [&self.plane, &self.model, &self.ball]
    }

    pub fn material_count(&self) -> u32 {
        self.registry.count()
    }

    pub fn update(&mut self, dt: f32) {
        self.orbit.update(dt);
    }

    pub fn camera(&self, width: u32, height: u32) -> Camera {
        self.orbit.camera(Viewport::full(width, height))
    }

    pub fn upload(&mut self, gpu: &GpuContext) {
        for instance in [&mut self.plane, &mut self.model, &mut self.ball] {
            instance.upload(gpu);
        }
    }

    /// One software frame: clear, store every drawable, resolve into `target`.
    pub fn render(&self, kbuffer: &mut KBuffer, target: &mut ImageTarget) -> FrameStats {
        let camera = self.camera(kbuffer.width(), kbuffer.height());
        kbuffer.set_store_pass_material_count(self.material_count());
        kbuffer.clear_pass();
        for drawable in self.drawables() {
            kbuffer.draw(drawable, Some(&camera));
        }
        kbuffer.resolve(target, true, self.background, Some(&camera));
        kbuffer.stats()
    }
}

/// Renders the scene after `frames` steps of 1/60 s with the software
/// K-Buffer and writes it as a PNG.
pub fn render_snapshot(
    scene: &SceneConfig,
    config: &KBufferConfig,
    frames: u32,
    path: &Path,
) -> Result<FrameStats, SceneError> {
    let mut scene = DemoScene::new(scene)?;
    for _ in 0..frames {
        scene.update(1.0 / 60.0);
    }

    let mut kbuffer = KBuffer::from_config(config.clone());
    let mut target = ImageTarget::new(kbuffer.width(), kbuffer.height());
    let stats = scene.render(&mut kbuffer, &mut target);
    log::info!(
        "{} fragments stored, {} dropped, {} occluded",
        stats.fragments_stored,
        stats.fragments_dropped,
        stats.fragments_occluded
    );
    target.save_png(path)?;
    Ok(stats)
}
