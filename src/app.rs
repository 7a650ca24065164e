//! Windowed sample: the demo scene through the GPU K-Buffer.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::KeyCode;
use winit::window::{Window, WindowAttributes, WindowId};

use crate::config::{Config, ConfigError, KBufferConfig};
use crate::demo::{DemoScene, SceneConfig, SceneError};
use crate::editor::{Input, KBufferEditor};
use crate::gpu::{GpuContext, GpuError};
use crate::kbuffer::GpuKBuffer;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub kbuffer: KBufferConfig,
    pub scene: SceneConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "K-Buffer".to_string(),
            width: 800,
            height: 600,
            kbuffer: KBufferConfig {
                depth_test: false,
                ..Default::default()
            },
            scene: SceneConfig::default(),
        }
    }
}

impl Config for AppConfig {}

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Window size; the K-Buffer follows it.
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self.kbuffer.width = width;
        self.kbuffer.height = height;
        self
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scene(#[from] SceneError),
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error("failed to create window: {0}")]
    Window(#[from] winit::error::OsError),
    #[error("event loop error: {0}")]
    EventLoop(#[from] winit::error::EventLoopError),
}

/// Opens a window and renders the demo scene until it is closed or Escape
/// is pressed.
pub fn run(config: AppConfig) -> Result<(), AppError> {
    let scene = DemoScene::new(&config.scene)?;

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = KBufferApp::Pending {
        config,
        scene: Some(scene),
    };
    event_loop.run_app(&mut app)?;

    match app {
        KBufferApp::Failed(e) => Err(e),
        _ => Ok(()),
    }
}

enum KBufferApp {
    Pending {
        config: AppConfig,
        scene: Option<DemoScene>,
    },
    Running {
        window: Arc<Window>,
        gpu: GpuContext,
        kbuffer: GpuKBuffer,
        scene: DemoScene,
        editor: KBufferEditor,
        input: Input,
        last_frame: Instant,
    },
    Failed(AppError),
}

impl KBufferApp {
    fn start(
        event_loop: &ActiveEventLoop,
        config: &AppConfig,
        mut scene: DemoScene,
    ) -> Result<Self, AppError> {
        let window_attrs = WindowAttributes::default()
            .with_title(&config.title)
            .with_inner_size(winit::dpi::LogicalSize::new(config.width, config.height));
        let window = Arc::new(event_loop.create_window(window_attrs)?);
        let gpu = GpuContext::new(window.clone())?;

        scene.upload(&gpu);
        // The K-Buffer covers the whole surface.
        let kbuffer_config = KBufferConfig {
            width: gpu.width(),
            height: gpu.height(),
            ..config.kbuffer.clone()
        };
        let mut kbuffer = GpuKBuffer::new(&gpu, kbuffer_config);
        kbuffer.set_store_pass_material_count(scene.material_count());
        log::info!("{}", KBufferEditor::property_sheet(&kbuffer));

        Ok(KBufferApp::Running {
            window,
            gpu,
            kbuffer,
            scene,
            editor: KBufferEditor::new(),
            input: Input::new(),
            last_frame: Instant::now(),
        })
    }
}

impl ApplicationHandler for KBufferApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let KBufferApp::Pending { config, scene } = self else {
            return;
        };
        let Some(scene) = scene.take() else {
            return;
        };
        *self = match Self::start(event_loop, config, scene) {
            Ok(running) => running,
            Err(e) => {
                log::error!("{}", e);
                event_loop.exit();
                KBufferApp::Failed(e)
            }
        };
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let KBufferApp::Running {
            window,
            gpu,
            kbuffer,
            scene,
            editor,
            input,
            last_frame,
        } = self
        else {
            return;
        };

        input.handle_event(&event);

        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                gpu.resize(size.width, size.height);
                kbuffer.resize(gpu.width(), gpu.height());
            }
            WindowEvent::RedrawRequested => {
                if input.key_pressed(KeyCode::Escape) {
                    event_loop.exit();
                    return;
                }

                let now = Instant::now();
                let dt = now.duration_since(*last_frame).as_secs_f32();
                *last_frame = now;

                scene.update(dt);
                editor.update(input, kbuffer);

                let Some(surface) = gpu.surface.as_ref() else {
                    return;
                };
                let output = match surface.get_current_texture() {
                    Ok(output) => output,
                    Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                        surface.configure(&gpu.device, &gpu.config);
                        window.request_redraw();
                        return;
                    }
                    Err(e) => {
                        log::warn!("skipping frame: {}", e);
                        window.request_redraw();
                        return;
                    }
                };
                let view = output
                    .texture
                    .create_view(&wgpu::TextureViewDescriptor::default());

                let camera = scene.camera(gpu.width(), gpu.height());
                kbuffer.clear_pass(gpu);
                for drawable in scene.drawables() {
                    kbuffer.draw(gpu, drawable, Some(&camera));
                }
                kbuffer.resolve(
                    gpu,
                    &view,
                    gpu.config.format,
                    true,
                    scene.background,
                    Some(&camera),
                );
                output.present();

                input.begin_frame();
                window.request_redraw();
            }
            _ => {}
        }
    }
}
