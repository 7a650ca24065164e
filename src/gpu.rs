//! Core GPU context and device management.
//!
//! [`GpuContext`] holds the wgpu device, queue and, unless headless, the
//! window surface. The K-Buffer keeps its fragment slots in storage buffers
//! written from the fragment stage, so device creation fails early on
//! adapters that cannot do that.

use std::sync::Arc;
use winit::window::Window;

#[derive(thiserror::Error, Debug)]
pub enum GpuError {
    #[error("failed to create surface: {0}")]
    Surface(#[from] wgpu::CreateSurfaceError),
    #[error("no suitable GPU adapter: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    #[error("failed to create device: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
    #[error("adapter lacks {0}")]
    MissingCapability(&'static str),
    #[error("surface is not supported by the adapter")]
    IncompatibleSurface,
}

/// Storage buffers bound by the store pass at once.
const STORE_PASS_STORAGE_BUFFERS: u32 = 6;

/// Color format of headless contexts.
pub const HEADLESS_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

pub struct GpuContext {
    /// `None` for a headless context.
    pub surface: Option<wgpu::Surface<'static>>,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    /// Surface configuration; for a headless context only its size and
    /// format are meaningful.
    pub config: wgpu::SurfaceConfiguration,
}

fn instance() -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::PRIMARY,
        ..Default::default()
    })
}

/// Checks the adapter can run the store pass and creates the device.
fn request_device(adapter: &wgpu::Adapter) -> Result<(wgpu::Device, wgpu::Queue), GpuError> {
    let info = adapter.get_info();
    log::info!("using {} ({:?})", info.name, info.backend);

    let downlevel = adapter.get_downlevel_capabilities();
    if !downlevel
        .flags
        .contains(wgpu::DownlevelFlags::FRAGMENT_WRITABLE_STORAGE)
    {
        return Err(GpuError::MissingCapability("fragment-writable storage buffers"));
    }

    let adapter_limits = adapter.limits();
    if adapter_limits.max_storage_buffers_per_shader_stage < STORE_PASS_STORAGE_BUFFERS {
        return Err(GpuError::MissingCapability("six storage buffers per shader stage"));
    }
    let required_limits = wgpu::Limits {
        max_storage_buffers_per_shader_stage: STORE_PASS_STORAGE_BUFFERS,
        max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
        max_buffer_size: adapter_limits.max_buffer_size,
        ..wgpu::Limits::default().using_resolution(adapter_limits.clone())
    };

    let device = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
        label: Some("K-Buffer Device"),
        required_features: wgpu::Features::empty(),
        required_limits,
        memory_hints: Default::default(),
        trace: Default::default(),
        experimental_features: Default::default(),
    }))?;
    Ok(device)
}

impl GpuContext {
    /// Creates the device and configures the surface for `window`.
    pub fn new(window: Arc<Window>) -> Result<Self, GpuError> {
        let size = window.inner_size();
        let instance = instance();
        let surface = instance.create_surface(window)?;

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))?;
        let (device, queue) = request_device(&adapter)?;

        let surface_caps = surface.get_capabilities(&adapter);
        // Resolve writes display-ready values, so prefer a linear format.
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| !f.is_srgb())
            .or_else(|| surface_caps.formats.first())
            .copied()
            .ok_or(GpuError::IncompatibleSurface)?;
        let alpha_mode = surface_caps
            .alpha_modes
            .first()
            .copied()
            .ok_or(GpuError::IncompatibleSurface)?;

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        Ok(Self {
            surface: Some(surface),
            device,
            queue,
            config,
        })
    }

    /// Device without a window, for off-screen rendering into
    /// [`HEADLESS_FORMAT`] textures.
    pub fn headless(width: u32, height: u32) -> Result<Self, GpuError> {
        let instance = instance();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))?;
        let (device, queue) = request_device(&adapter)?;

        Ok(Self {
            surface: None,
            device,
            queue,
            config: wgpu::SurfaceConfiguration {
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
                format: HEADLESS_FORMAT,
                width: width.max(1),
                height: height.max(1),
                present_mode: wgpu::PresentMode::Fifo,
                alpha_mode: wgpu::CompositeAlphaMode::Opaque,
                view_formats: vec![],
                desired_maximum_frame_latency: 2,
            },
        })
    }

    /// Ignores zero sizes, which occur while the window is minimized.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.config.width = width;
            self.config.height = height;
            if let Some(surface) = &self.surface {
                surface.configure(&self.device, &self.config);
            }
        }
    }

    pub fn width(&self) -> u32 {
        self.config.width
    }

    pub fn height(&self) -> u32 {
        self.config.height
    }

    pub fn aspect(&self) -> f32 {
        self.config.width as f32 / self.config.height as f32
    }
}
