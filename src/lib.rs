//! # kbuffer
//!
//! **Order-independent transparency with a K-Buffer.**
//!
//! Every pixel keeps up to K fragments. A store pass captures them in any
//! draw order, a resolve pass sorts each pixel by depth and composites it
//! front to back. Translucent materials are tinted by the distance light
//! travels between their entry and exit surfaces.
//!
//! Two backends share the data model and compositing rules:
//!
//! - [`KBuffer`] rasterizes on the CPU with rayon and resolves into any
//!   [`RenderTarget`], such as an [`ImageTarget`] saved as PNG.
//! - [`GpuKBuffer`] keeps the fragment slots in wgpu storage buffers.
//!
//! ```no_run
//! use ::kbuffer::*;
//!
//! let scene = DemoScene::new(&SceneConfig::default())?;
//! let mut kbuffer = KBuffer::new(800, 600, 16);
//! let mut target = ImageTarget::new(800, 600);
//! scene.render(&mut kbuffer, &mut target);
//! target.save_png("frame.png")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod app;
mod camera;
mod color;
mod config;
mod demo;
mod drawable;
mod editor;
mod geometry;
mod gpu;
pub mod kbuffer;
mod material;
mod mesh;
mod orbit_camera;
mod target;

pub use app::{AppConfig, AppError, run};
pub use camera::{Camera, CameraUniforms, Projection, Viewport};
pub use color::Color;
pub use config::{
    Config, ConfigError, CullMode, KBufferConfig, MAX_K, MIN_K, OverflowPolicy, clamp_k,
};
pub use demo::{DemoScene, SceneConfig, SceneError, render_snapshot};
pub use drawable::{
    DrawError, Drawable, HasMaterial, HasTransform, HasVertexData, MeshInstance,
    check_count_primitive, validate_vertex_data,
};
pub use editor::{EditorAction, Input, KBufferEditor};
pub use geometry::{GeometryError, GeometryLoader, load_stl};
pub use gpu::{GpuContext, GpuError, HEADLESS_FORMAT};
pub use kbuffer::{
    FragmentRecord, FragmentStore, FramePhase, FrameStats, GpuKBuffer, KBuffer, KBufferSettings,
    MaterialEntry, MaterialPalette, MaterialRegistry, ResolveSettings,
};
pub use material::{Material, ParamValue, StorePassMaterial};
pub use mesh::{Mesh, MeshData, PrimitiveType, Transform, Vertex3d};
pub use orbit_camera::{OrbitCamera, OrbitMode};
pub use target::{ImageAccess, ImageBinding, ImageTarget, RenderTarget, SnapshotError};

pub use glam::{Mat4, Quat, Vec3, Vec4};
