//! K-Buffer order-independent transparency.
//!
//! A frame runs in three steps:
//!
//! 1. [`KBuffer::clear_pass`] empties every pixel's fragment slots.
//! 2. [`KBuffer::draw`] rasterizes a drawable; every fragment atomically
//!    claims one of the K slots of its pixel. Fragments beyond K are dropped
//!    (or, with [`OverflowPolicy::KeepNearest`], evict the farthest one).
//! 3. [`KBuffer::resolve`] sorts each pixel's fragments by depth and
//!    composites them front to back into a render target.
//!
//! Draw order does not matter: all sorting happens in the resolve pass.
//!
//! ```
//! use ::kbuffer::*;
//!
//! let registry = MaterialRegistry::new();
//! let glass = StorePassMaterial::new(&registry).base_color(Color::BLUE.with_alpha(0.5));
//! let quad = MeshInstance::new("glass", MeshData::quad(2.0, 2.0), glass)
//!     .with_transform(Transform::from_position(Vec3::new(0.0, 0.0, -2.0)));
//!
//! let camera = Camera::new()
//!     .orthographic(2.0)
//!     .clip(0.1, 10.0)
//!     .viewport(Viewport::full(16, 16));
//!
//! let mut kbuffer = KBuffer::new(16, 16, 4);
//! kbuffer.set_store_pass_material_count(registry.count());
//! let mut target = ImageTarget::new(16, 16);
//!
//! kbuffer.clear_pass();
//! kbuffer.draw(&quad, Some(&camera));
//! kbuffer.resolve(&mut target, true, Color::WHITE, Some(&camera));
//!
//! let pixel = target.pixel(8, 8).unwrap();
//! assert!((pixel.r - 0.5).abs() < 1e-5 && (pixel.b - 1.0).abs() < 1e-5);
//! ```
//!
//! The same protocol runs on the GPU through [`GpuKBuffer`].

mod fragment_store;
mod frame;
pub mod gpu;
mod palette;
mod raster;
mod resolve;
mod store_pass;

pub use fragment_store::{FAR_DEPTH, FragmentArray, FragmentRecord, FragmentStore};
pub use frame::{FramePhase, FrameStats};
pub use gpu::GpuKBuffer;
pub use palette::{MaterialEntry, MaterialPalette, MaterialRegistry};
pub use raster::{ClipVertex, RasterFragment, Rasterizer};
pub use resolve::{
    ResolveSettings, composite, post_process, resolve_pixel, sort_fragments, translucent_color,
};
pub use store_pass::DepthAttachment;

use std::sync::atomic::{Ordering, fence};

use crate::camera::Camera;
use crate::color::Color;
use crate::config::{
    CullMode, KBufferConfig, OverflowPolicy, clamp_k, sanitize_exposure, sanitize_gamma,
    sanitize_material_capacity,
};
use crate::drawable::{DrawError, Drawable, validate_vertex_data};
use crate::target::{ImageAccess, RenderTarget};
use store_pass::StorePass;

/// Runtime-adjustable resolve settings shared by both backends.
pub trait KBufferSettings {
    fn k(&self) -> u32;
    fn set_k(&mut self, k: u32);
    fn is_tone_mapped(&self) -> bool;
    fn set_tone_mapped(&mut self, tone_mapped: bool);
    fn exposure(&self) -> f32;
    fn set_exposure(&mut self, exposure: f32);
    fn is_gamma_corrected(&self) -> bool;
    fn set_gamma_corrected(&mut self, gamma_corrected: bool);
    fn gamma(&self) -> f32;
    fn set_gamma(&mut self, gamma: f32);
}

/// Software K-Buffer.
pub struct KBuffer {
    config: KBufferConfig,
    store: FragmentStore,
    depth: DepthAttachment,
    palette: MaterialPalette,
    phase: FramePhase,
    stats: FrameStats,
    active_camera: Option<Camera>,
}

impl KBuffer {
    /// K is clamped to `[1, 16]`.
    pub fn new(width: u32, height: u32, k: u32) -> Self {
        Self::from_config(KBufferConfig::new(width, height, k))
    }

    pub fn from_config(config: KBufferConfig) -> Self {
        let config = config.sanitized();
        let mut store = FragmentStore::new(config.width, config.height, config.k);
        store.set_overflow_policy(config.overflow);
        Self {
            depth: DepthAttachment::new(store.pixel_count()),
            palette: MaterialPalette::with_capacity(config.material_capacity),
            store,
            config,
            phase: FramePhase::Idle,
            stats: FrameStats::default(),
            active_camera: None,
        }
    }

    pub fn config(&self) -> &KBufferConfig {
        &self.config
    }

    pub fn width(&self) -> u32 {
        self.config.width
    }

    pub fn height(&self) -> u32 {
        self.config.height
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    /// Counters since the last clear pass.
    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn palette(&self) -> &MaterialPalette {
        &self.palette
    }

    pub fn store_pass_material_count(&self) -> u32 {
        self.palette.capacity()
    }

    /// Reserves palette entries for `count` materials. Zero and negative
    /// counts are coerced to 1. The palette never shrinks below entries
    /// already written.
    pub fn set_store_pass_material_count(&mut self, count: impl Into<i64>) {
        let count = sanitize_material_capacity(count.into());
        if count == self.config.material_capacity {
            return;
        }
        self.config.material_capacity = count;
        self.palette.resize(count);
        self.discard_frame();
    }

    pub fn set_depth_test(&mut self, enabled: bool) {
        self.config.depth_test = enabled;
    }

    pub fn set_cull_mode(&mut self, cull_mode: CullMode) {
        self.config.cull_mode = cull_mode;
    }

    pub fn set_overflow_policy(&mut self, policy: OverflowPolicy) {
        self.config.overflow = policy;
        self.store.set_overflow_policy(policy);
    }

    /// Camera used by draws and resolves that do not pass one.
    pub fn set_active_camera(&mut self, camera: Option<Camera>) {
        self.active_camera = camera;
    }

    /// Reallocates for a new size. Same size is a no-op and keeps the
    /// stored fragments.
    pub fn resize(&mut self, width: u32, height: u32) {
        let (width, height) = (width.max(1), height.max(1));
        if (width, height) == (self.config.width, self.config.height) {
            return;
        }
        self.config.width = width;
        self.config.height = height;
        self.store.resize(width, height, self.config.k);
        self.depth = DepthAttachment::new(self.store.pixel_count());
        self.discard_frame();
    }

    fn discard_frame(&mut self) {
        if self.phase != FramePhase::Idle {
            log::debug!("K-Buffer reconfigured during {:?}, frame data discarded", self.phase);
        }
        self.phase = FramePhase::Idle;
    }

    /// Empties all fragment slots and the depth attachment.
    pub fn clear_pass(&mut self) {
        self.store.clear();
        self.depth.clear();
        self.stats = FrameStats::default();
        self.phase = FramePhase::Cleared;
    }

    /// Stores the fragments of `drawable`.
    ///
    /// Disabled drawables are skipped silently. Inconsistent vertex data or a
    /// missing camera (neither `camera` nor an active one) is logged and the
    /// draw is skipped.
    pub fn draw(&mut self, drawable: &dyn Drawable, camera: Option<&Camera>) {
        if !drawable.is_enabled() {
            return;
        }
        if let Err(e) = self.check_draw(drawable, camera) {
            log::warn!("{}", e);
            self.stats.skipped_draws += 1;
            return;
        }
        let Some(camera) = camera.or(self.active_camera.as_ref()).copied() else {
            return;
        };

        drawable.on_draw_begin();

        let material = drawable.material();
        let entry = material.entry();
        self.palette.set(material.index(), entry);

        let pass = StorePass {
            store: &self.store,
            depth: &self.depth,
            raster: Rasterizer::new(
                camera.viewport,
                self.config.width,
                self.config.height,
                self.config.cull_mode,
            ),
            depth_test: self.config.depth_test,
            material: material.index(),
            opaque: entry.is_opaque(),
        };
        let dropped_before = self.store.dropped();
        let mut stats = pass.run(
            drawable.vertex_data(),
            camera.view_matrix() * drawable.model_matrix(),
            camera.projection_matrix(),
        );
        stats.fragments_dropped = self.store.dropped() - dropped_before;
        stats.draws = 1;
        log::trace!(
            "material {}: {} stored, {} dropped, {} occluded",
            material.index(),
            stats.fragments_stored,
            stats.fragments_dropped,
            stats.fragments_occluded
        );
        self.stats += stats;

        drawable.on_draw_end();
        self.phase = self.phase.after_draw();
    }

    fn check_draw(&self, drawable: &dyn Drawable, camera: Option<&Camera>) -> Result<(), DrawError> {
        validate_vertex_data(drawable.vertex_data())?;
        if camera.is_none() && self.active_camera.is_none() {
            return Err(DrawError::NoCamera);
        }
        Ok(())
    }

    /// Composites the stored fragments into `target`.
    ///
    /// Only pixels inside the camera viewport are written. Pixels without
    /// fragments get `background`. Without a camera (neither `camera` nor an
    /// active one) nothing is resolved and the target is left untouched.
    pub fn resolve<T: RenderTarget + ?Sized>(
        &mut self,
        target: &mut T,
        clear_target: bool,
        background: Color,
        camera: Option<&Camera>,
    ) {
        let (width, height) = target.size();
        let Some(viewport) = camera.or(self.active_camera.as_ref()).map(|c| c.viewport) else {
            log::warn!("No valid camera to use for the resolve pass.");
            return;
        };

        // Store-pass writes must be visible before any pixel is read.
        fence(Ordering::SeqCst);

        target.bind();
        if clear_target {
            target.clear(background);
        }

        let settings = self.resolve_settings(background);
        {
            let mut image = target.bind_as_image(ImageAccess::WriteOnly);
            if let Some(pixels) = image.pixels_mut() {
                resolve::resolve_region(
                    &self.store,
                    &self.palette,
                    &settings,
                    pixels,
                    width,
                    viewport.clamp_to(width, height),
                );
            }
        }
        target.unbind();

        if self.stats.fragments_dropped > 0 {
            log::debug!(
                "{} fragments dropped by the K = {} limit this frame",
                self.stats.fragments_dropped,
                self.config.k
            );
        }
        self.phase = FramePhase::Resolved;
    }

    pub fn resolve_settings(&self, background: Color) -> ResolveSettings {
        ResolveSettings {
            background,
            tone_mapped: self.config.tone_mapped,
            exposure: self.config.exposure,
            gamma_corrected: self.config.gamma_corrected,
            gamma: self.config.gamma,
        }
    }

    /// Occupied slot count of a pixel, `None` outside the buffer.
    pub fn occupancy(&self, x: u32, y: u32) -> Option<u32> {
        self.store
            .pixel_index(x, y)
            .map(|p| self.store.occupancy(p))
    }

    /// Stored fragments of a pixel in slot order.
    pub fn fragments(&self, x: u32, y: u32) -> Vec<FragmentRecord> {
        let Some(pixel) = self.store.pixel_index(x, y) else {
            return Vec::new();
        };
        (0..self.store.occupancy(pixel))
            .filter_map(|slot| self.store.fragment(pixel, slot))
            .collect()
    }

    pub fn fragment_store(&self) -> &FragmentStore {
        &self.store
    }
}

impl KBufferSettings for KBuffer {
    fn k(&self) -> u32 {
        self.config.k
    }

    /// Clamped to `[1, 16]`. Reallocates the slot channels only.
    fn set_k(&mut self, k: u32) {
        let k = clamp_k(k);
        if k == self.config.k {
            return;
        }
        self.config.k = k;
        self.store
            .resize(self.config.width, self.config.height, k);
        self.discard_frame();
    }

    fn is_tone_mapped(&self) -> bool {
        self.config.tone_mapped
    }

    fn set_tone_mapped(&mut self, tone_mapped: bool) {
        self.config.tone_mapped = tone_mapped;
    }

    fn exposure(&self) -> f32 {
        self.config.exposure
    }

    fn set_exposure(&mut self, exposure: f32) {
        self.config.exposure = sanitize_exposure(exposure);
    }

    fn is_gamma_corrected(&self) -> bool {
        self.config.gamma_corrected
    }

    fn set_gamma_corrected(&mut self, gamma_corrected: bool) {
        self.config.gamma_corrected = gamma_corrected;
    }

    fn gamma(&self) -> f32 {
        self.config.gamma
    }

    fn set_gamma(&mut self, gamma: f32) {
        self.config.gamma = sanitize_gamma(gamma);
    }
}
