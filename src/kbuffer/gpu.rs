//! GPU K-Buffer.
//!
//! The fragment slots live in storage buffers. The store pass is a render
//! pass without color targets whose fragment shader claims slots with
//! `atomicAdd`; the resolve pass draws a fullscreen triangle that sorts and
//! composites every pixel. Each pass is its own queue submission, which
//! orders the storage writes of one pass before the reads of the next.
//!
//! # Bind Groups
//!
//! | Pass    | Group | Contents                                               |
//! |---------|-------|--------------------------------------------------------|
//! | store   | 0     | camera uniforms, draw uniforms                         |
//! | store   | 1     | counts, semaphores, opaque depth, material/depth/pos   |
//! | resolve | 0     | resolve uniforms, slot buffers (read only), palette    |
//! | clear   | 0     | clear params, opaque depth, slot depths                |

use std::collections::HashMap;

use wgpu::util::DeviceExt;

use super::frame::{FramePhase, FrameStats};
use super::palette::{MaterialEntry, MaterialPalette};
use super::KBufferSettings;
use crate::camera::{Camera, CameraUniforms};
use crate::color::Color;
use crate::config::{
    CullMode, KBufferConfig, OverflowPolicy, clamp_k, sanitize_exposure, sanitize_gamma,
    sanitize_material_capacity,
};
use crate::drawable::{DrawError, Drawable, validate_vertex_data};
use crate::gpu::GpuContext;
use crate::mesh::{PrimitiveType, Vertex3d};

const CLEAR_WORKGROUP: u32 = 64;
const MAX_DISPATCH: u32 = 65535;
/// Bytes per slot in the largest slot buffer (three f32 positions).
const POSITION_BYTES: u64 = 12;

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct DrawUniforms {
    model: [[f32; 4]; 4],
    material: u32,
    k: u32,
    width: u32,
    height: u32,
    opaque: u32,
    depth_test: u32,
    keep_nearest: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct ResolveUniforms {
    background: [f32; 4],
    width: u32,
    height: u32,
    k: u32,
    material_count: u32,
    tone_mapped: u32,
    gamma_corrected: u32,
    exposure: f32,
    gamma: f32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct ClearUniforms {
    opaque_len: u32,
    slot_len: u32,
    row_stride: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct GpuMaterial {
    base: [f32; 4],
    translucent: [f32; 4],
    is_translucent: u32,
    max_thickness: f32,
    _pad: [u32; 2],
}

impl From<&MaterialEntry> for GpuMaterial {
    fn from(entry: &MaterialEntry) -> Self {
        Self {
            base: entry.base_color.to_array(),
            translucent: entry.translucent_color.to_array(),
            is_translucent: entry.is_translucent as u32,
            max_thickness: entry.max_translucent_thickness,
            _pad: [0; 2],
        }
    }
}

/// Per-pixel and per-slot storage.
struct SlotBuffers {
    width: u32,
    height: u32,
    k: u32,
    counts: wgpu::Buffer,
    semaphores: wgpu::Buffer,
    opaque_depth: wgpu::Buffer,
    materials: wgpu::Buffer,
    depths: wgpu::Buffer,
    positions: wgpu::Buffer,
    _depth_texture: wgpu::Texture,
    depth_view: wgpu::TextureView,
}

impl SlotBuffers {
    fn new(device: &wgpu::Device, width: u32, height: u32, k: u32) -> Self {
        let pixels = width as u64 * height as u64;
        let slots = pixels * k as u64;
        let storage = |label: &str, size: u64, usage: wgpu::BufferUsages| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: size.max(4),
                usage: wgpu::BufferUsages::STORAGE | usage,
                mapped_at_creation: false,
            })
        };
        let depth_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("K-Buffer Store Depth"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Depth32Float,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let depth_view = depth_texture.create_view(&wgpu::TextureViewDescriptor::default());

        Self {
            width,
            height,
            k,
            counts: storage("K-Buffer Counts", pixels * 4, wgpu::BufferUsages::COPY_DST),
            semaphores: storage("K-Buffer Semaphores", pixels * 4, wgpu::BufferUsages::COPY_DST),
            opaque_depth: storage("K-Buffer Opaque Depth", pixels * 4, wgpu::BufferUsages::empty()),
            materials: storage("K-Buffer Materials", slots * 4, wgpu::BufferUsages::empty()),
            depths: storage("K-Buffer Depths", slots * 4, wgpu::BufferUsages::empty()),
            positions: storage(
                "K-Buffer Positions",
                slots * POSITION_BYTES,
                wgpu::BufferUsages::empty(),
            ),
            _depth_texture: depth_texture,
            depth_view,
        }
    }

    fn pixel_count(&self) -> u32 {
        self.width * self.height
    }
}

fn storage_entry(binding: u32, visibility: wgpu::ShaderStages, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// K-Buffer on the GPU.
pub struct GpuKBuffer {
    config: KBufferConfig,
    /// K actually allocated; `config.k` reduced to fit the storage limits.
    allocated_k: u32,
    max_binding_size: u64,
    reallocate: bool,
    phase: FramePhase,
    stats: FrameStats,
    palette: MaterialPalette,
    active_camera: Option<Camera>,

    slots: SlotBuffers,

    store_shader: wgpu::ShaderModule,
    store_pipeline_layout: wgpu::PipelineLayout,
    store_pipelines: HashMap<(PrimitiveType, CullMode), wgpu::RenderPipeline>,
    camera_buffer: wgpu::Buffer,
    draw_buffer: wgpu::Buffer,
    uniforms_bind_group: wgpu::BindGroup,
    slots_layout: wgpu::BindGroupLayout,
    slots_bind_group: wgpu::BindGroup,

    resolve_shader: wgpu::ShaderModule,
    resolve_layout: wgpu::BindGroupLayout,
    resolve_pipeline_layout: wgpu::PipelineLayout,
    resolve_pipelines: HashMap<wgpu::TextureFormat, wgpu::RenderPipeline>,
    resolve_buffer: wgpu::Buffer,
    palette_buffer: wgpu::Buffer,
    palette_len: u32,
    resolve_bind_group: wgpu::BindGroup,

    clear_pipeline: wgpu::ComputePipeline,
    clear_layout: wgpu::BindGroupLayout,
    clear_buffer: wgpu::Buffer,
    clear_bind_group: wgpu::BindGroup,
}

impl GpuKBuffer {
    pub fn new(gpu: &GpuContext, config: KBufferConfig) -> Self {
        let device = &gpu.device;
        let config = config.sanitized();
        let max_binding_size = device
            .limits()
            .max_storage_buffer_binding_size
            .min(device.limits().max_buffer_size.min(u32::MAX as u64) as u32)
            as u64;
        let allocated_k = fit_k(config.k, config.width, config.height, max_binding_size);
        let slots = SlotBuffers::new(device, config.width, config.height, allocated_k);

        // Store pass
        let store_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("K-Buffer Store Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/kbuffer_store.wgsl").into()),
        });
        let uniforms_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("K-Buffer Store Uniforms Layout"),
            entries: &[
                uniform_entry(0, wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT),
                uniform_entry(1, wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT),
            ],
        });
        let slots_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("K-Buffer Slots Layout"),
            entries: &(0..6)
                .map(|b| storage_entry(b, wgpu::ShaderStages::FRAGMENT, false))
                .collect::<Vec<_>>(),
        });
        let store_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("K-Buffer Store Pipeline Layout"),
            bind_group_layouts: &[&uniforms_layout, &slots_layout],
            push_constant_ranges: &[],
        });
        let camera_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("K-Buffer Camera Uniforms"),
            size: std::mem::size_of::<CameraUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let draw_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("K-Buffer Draw Uniforms"),
            size: std::mem::size_of::<DrawUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let uniforms_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("K-Buffer Store Uniforms"),
            layout: &uniforms_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: camera_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: draw_buffer.as_entire_binding(),
                },
            ],
        });
        let slots_bind_group = create_slots_bind_group(device, &slots_layout, &slots);

        // Resolve pass
        let resolve_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("K-Buffer Resolve Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/kbuffer_resolve.wgsl").into()),
        });
        let mut resolve_entries = vec![uniform_entry(0, wgpu::ShaderStages::FRAGMENT)];
        resolve_entries.extend((1..6).map(|b| storage_entry(b, wgpu::ShaderStages::FRAGMENT, true)));
        let resolve_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("K-Buffer Resolve Layout"),
            entries: &resolve_entries,
        });
        let resolve_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("K-Buffer Resolve Pipeline Layout"),
                bind_group_layouts: &[&resolve_layout],
                push_constant_ranges: &[],
            });
        let resolve_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("K-Buffer Resolve Uniforms"),
            size: std::mem::size_of::<ResolveUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let palette = MaterialPalette::with_capacity(config.material_capacity);
        let palette_buffer = create_palette_buffer(device, &palette);
        let resolve_bind_group =
            create_resolve_bind_group(device, &resolve_layout, &resolve_buffer, &slots, &palette_buffer);

        // Clear pass
        let clear_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("K-Buffer Clear Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/kbuffer_clear.wgsl").into()),
        });
        let clear_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("K-Buffer Clear Layout"),
            entries: &[
                uniform_entry(0, wgpu::ShaderStages::COMPUTE),
                storage_entry(1, wgpu::ShaderStages::COMPUTE, false),
                storage_entry(2, wgpu::ShaderStages::COMPUTE, false),
            ],
        });
        let clear_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("K-Buffer Clear Pipeline Layout"),
            bind_group_layouts: &[&clear_layout],
            push_constant_ranges: &[],
        });
        let clear_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("K-Buffer Clear Pipeline"),
            layout: Some(&clear_pipeline_layout),
            module: &clear_shader,
            entry_point: Some("clear"),
            compilation_options: Default::default(),
            cache: None,
        });
        let clear_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("K-Buffer Clear Uniforms"),
            size: std::mem::size_of::<ClearUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let clear_bind_group = create_clear_bind_group(device, &clear_layout, &clear_buffer, &slots);

        log::info!(
            "GPU K-Buffer {}x{} with K = {}",
            config.width,
            config.height,
            allocated_k
        );

        Self {
            palette_len: palette.capacity(),
            palette,
            config,
            allocated_k,
            max_binding_size,
            reallocate: false,
            phase: FramePhase::Idle,
            stats: FrameStats::default(),
            active_camera: None,
            slots,
            store_shader,
            store_pipeline_layout,
            store_pipelines: HashMap::new(),
            camera_buffer,
            draw_buffer,
            uniforms_bind_group,
            slots_layout,
            slots_bind_group,
            resolve_shader,
            resolve_layout,
            resolve_pipeline_layout,
            resolve_pipelines: HashMap::new(),
            resolve_buffer,
            palette_buffer,
            resolve_bind_group,
            clear_pipeline,
            clear_layout,
            clear_buffer,
            clear_bind_group,
        }
    }

    pub fn config(&self) -> &KBufferConfig {
        &self.config
    }

    /// K in use, which may be below [`KBufferSettings::k`] on small devices.
    pub fn allocated_k(&self) -> u32 {
        self.allocated_k
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    /// Draw counts since the last clear. Fragment counters stay on the GPU.
    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn store_pass_material_count(&self) -> u32 {
        self.palette.capacity()
    }

    pub fn set_store_pass_material_count(&mut self, count: impl Into<i64>) {
        let count = sanitize_material_capacity(count.into());
        if count == self.config.material_capacity {
            return;
        }
        self.config.material_capacity = count;
        self.palette.resize(count);
        self.phase = FramePhase::Idle;
    }

    pub fn set_depth_test(&mut self, enabled: bool) {
        self.config.depth_test = enabled;
    }

    pub fn set_cull_mode(&mut self, cull_mode: CullMode) {
        self.config.cull_mode = cull_mode;
    }

    pub fn set_overflow_policy(&mut self, policy: OverflowPolicy) {
        self.config.overflow = policy;
    }

    pub fn set_active_camera(&mut self, camera: Option<Camera>) {
        self.active_camera = camera;
    }

    /// Same size is a no-op. Buffers are reallocated on the next clear pass.
    pub fn resize(&mut self, width: u32, height: u32) {
        let (width, height) = (width.max(1), height.max(1));
        if (width, height) == (self.config.width, self.config.height) {
            return;
        }
        self.config.width = width;
        self.config.height = height;
        self.reallocate = true;
        self.phase = FramePhase::Idle;
    }

    fn reallocate_if_needed(&mut self, device: &wgpu::Device) {
        if !self.reallocate {
            return;
        }
        self.reallocate = false;
        let k = fit_k(self.config.k, self.config.width, self.config.height, self.max_binding_size);
        if (k, self.config.width, self.config.height)
            == (self.slots.k, self.slots.width, self.slots.height)
        {
            return;
        }
        self.allocated_k = k;
        self.slots = SlotBuffers::new(device, self.config.width, self.config.height, k);
        self.slots_bind_group = create_slots_bind_group(device, &self.slots_layout, &self.slots);
        self.clear_bind_group =
            create_clear_bind_group(device, &self.clear_layout, &self.clear_buffer, &self.slots);
        self.rebuild_resolve_bind_group(device);
        log::debug!(
            "GPU K-Buffer reallocated: {}x{} with K = {}",
            self.config.width,
            self.config.height,
            k
        );
    }

    fn rebuild_resolve_bind_group(&mut self, device: &wgpu::Device) {
        self.resolve_bind_group = create_resolve_bind_group(
            device,
            &self.resolve_layout,
            &self.resolve_buffer,
            &self.slots,
            &self.palette_buffer,
        );
    }

    /// Zeroes counts and semaphores and resets every depth to the far plane.
    pub fn clear_pass(&mut self, gpu: &GpuContext) {
        self.reallocate_if_needed(&gpu.device);

        let opaque_len = self.slots.pixel_count();
        let slot_len = opaque_len * self.slots.k;
        let groups = slot_len.max(opaque_len).div_ceil(CLEAR_WORKGROUP);
        let groups_x = groups.clamp(1, MAX_DISPATCH);
        let groups_y = groups.div_ceil(groups_x).max(1);
        let params = ClearUniforms {
            opaque_len,
            slot_len,
            row_stride: groups_x * CLEAR_WORKGROUP,
            _pad: 0,
        };
        gpu.queue
            .write_buffer(&self.clear_buffer, 0, bytemuck::bytes_of(&params));

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("K-Buffer Clear Encoder"),
            });
        encoder.clear_buffer(&self.slots.counts, 0, None);
        encoder.clear_buffer(&self.slots.semaphores, 0, None);
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("K-Buffer Clear Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.clear_pipeline);
            pass.set_bind_group(0, &self.clear_bind_group, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));

        self.stats = FrameStats::default();
        self.phase = FramePhase::Cleared;
    }

    /// Stores the fragments of `drawable`, which must have been uploaded.
    pub fn draw(&mut self, gpu: &GpuContext, drawable: &dyn Drawable, camera: Option<&Camera>) {
        if !drawable.is_enabled() {
            return;
        }
        let checked = validate_vertex_data(drawable.vertex_data()).and_then(|()| {
            let camera = camera
                .or(self.active_camera.as_ref())
                .copied()
                .ok_or(DrawError::NoCamera)?;
            let mesh = drawable.gpu_mesh().ok_or(DrawError::NotUploaded)?;
            Ok((camera, mesh))
        });
        let (camera, mesh) = match checked {
            Ok(checked) => checked,
            Err(e) => {
                log::warn!("{}", e);
                self.stats.skipped_draws += 1;
                return;
            }
        };
        let (x0, y0, x1, y1) = camera
            .viewport
            .clamp_to(self.slots.width, self.slots.height);
        if x1 <= x0 || y1 <= y0 {
            log::debug!("viewport {:?} is outside the K-Buffer", camera.viewport);
            return;
        }

        drawable.on_draw_begin();

        let material = drawable.material();
        let entry = material.entry();
        self.palette.set(material.index(), entry);

        let uniforms = DrawUniforms {
            model: drawable.model_matrix().to_cols_array_2d(),
            material: material.index(),
            k: self.slots.k,
            width: self.slots.width,
            height: self.slots.height,
            opaque: entry.is_opaque() as u32,
            depth_test: self.config.depth_test as u32,
            keep_nearest: (self.config.overflow == OverflowPolicy::KeepNearest) as u32,
            _pad: 0,
        };
        gpu.queue
            .write_buffer(&self.camera_buffer, 0, bytemuck::bytes_of(&camera.uniforms()));
        gpu.queue
            .write_buffer(&self.draw_buffer, 0, bytemuck::bytes_of(&uniforms));

        let key = (mesh.primitive(), self.config.cull_mode);
        if !self.store_pipelines.contains_key(&key) {
            let pipeline = create_store_pipeline(
                &gpu.device,
                &self.store_pipeline_layout,
                &self.store_shader,
                key.0,
                key.1,
            );
            self.store_pipelines.insert(key, pipeline);
        }
        let Some(pipeline) = self.store_pipelines.get(&key) else {
            return;
        };

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("K-Buffer Store Encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("K-Buffer Store Pass"),
                color_attachments: &[],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.slots.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Discard,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_viewport(
                x0 as f32,
                y0 as f32,
                (x1 - x0) as f32,
                (y1 - y0) as f32,
                0.0,
                1.0,
            );
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &self.uniforms_bind_group, &[]);
            pass.set_bind_group(1, &self.slots_bind_group, &[]);
            pass.set_vertex_buffer(0, mesh.vertex_buffer.slice(..));
            match &mesh.index_buffer {
                Some(indices) => {
                    pass.set_index_buffer(indices.slice(..), wgpu::IndexFormat::Uint32);
                    pass.draw_indexed(0..mesh.element_count(), 0, 0..1);
                }
                None => pass.draw(0..mesh.element_count(), 0..1),
            }
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));

        drawable.on_draw_end();
        self.stats.draws += 1;
        self.phase = self.phase.after_draw();
    }

    /// Composites the stored fragments into `view`, a texture of `format`
    /// with the K-Buffer's size. Does nothing without a camera.
    pub fn resolve(
        &mut self,
        gpu: &GpuContext,
        view: &wgpu::TextureView,
        format: wgpu::TextureFormat,
        clear_target: bool,
        background: Color,
        camera: Option<&Camera>,
    ) {
        let Some(camera) = camera.or(self.active_camera.as_ref()) else {
            log::warn!("No valid camera to use for the resolve pass.");
            return;
        };
        let (x0, y0, x1, y1) = camera
            .viewport
            .clamp_to(self.slots.width, self.slots.height);

        self.upload_palette(gpu);
        let uniforms = ResolveUniforms {
            background: background.to_array(),
            width: self.slots.width,
            height: self.slots.height,
            k: self.slots.k,
            material_count: self.palette_len,
            tone_mapped: self.config.tone_mapped as u32,
            gamma_corrected: self.config.gamma_corrected as u32,
            exposure: self.config.exposure,
            gamma: self.config.gamma,
        };
        gpu.queue
            .write_buffer(&self.resolve_buffer, 0, bytemuck::bytes_of(&uniforms));

        if !self.resolve_pipelines.contains_key(&format) {
            let pipeline = create_resolve_pipeline(
                &gpu.device,
                &self.resolve_pipeline_layout,
                &self.resolve_shader,
                format,
            );
            self.resolve_pipelines.insert(format, pipeline);
        }
        let Some(pipeline) = self.resolve_pipelines.get(&format) else {
            return;
        };

        let load = if clear_target {
            wgpu::LoadOp::Clear(background.into())
        } else {
            wgpu::LoadOp::Load
        };
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("K-Buffer Resolve Encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("K-Buffer Resolve Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            if x1 > x0 && y1 > y0 {
                pass.set_viewport(
                    x0 as f32,
                    y0 as f32,
                    (x1 - x0) as f32,
                    (y1 - y0) as f32,
                    0.0,
                    1.0,
                );
                pass.set_scissor_rect(x0, y0, x1 - x0, y1 - y0);
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, &self.resolve_bind_group, &[]);
                pass.draw(0..3, 0..1);
            }
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
        self.phase = FramePhase::Resolved;
    }

    fn upload_palette(&mut self, gpu: &GpuContext) {
        if self.palette.capacity() != self.palette_len {
            self.palette_buffer = create_palette_buffer(&gpu.device, &self.palette);
            self.palette_len = self.palette.capacity();
            self.rebuild_resolve_bind_group(&gpu.device);
        } else {
            let entries: Vec<GpuMaterial> =
                self.palette.entries().iter().map(GpuMaterial::from).collect();
            gpu.queue
                .write_buffer(&self.palette_buffer, 0, bytemuck::cast_slice(&entries));
        }
    }
}

impl KBufferSettings for GpuKBuffer {
    fn k(&self) -> u32 {
        self.config.k
    }

    fn set_k(&mut self, k: u32) {
        let k = clamp_k(k);
        if k == self.config.k {
            return;
        }
        self.config.k = k;
        self.reallocate = true;
        self.phase = FramePhase::Idle;
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

/// Largest K up to `k` whose position buffer fits in one storage binding.
fn fit_k(k: u32, width: u32, height: u32, max_binding_size: u64) -> u32 {
    let per_slot_layer = width as u64 * height as u64 * POSITION_BYTES;
    let fitting = (max_binding_size / per_slot_layer.max(1)).min(u32::MAX as u64) as u32;
    let fitted = clamp_k(k).min(fitting).max(1);
    if fitted < clamp_k(k) {
        log::warn!(
            "K = {} does not fit the storage limits at {}x{}, using K = {}",
            k,
            width,
            height,
            fitted
        );
    }
    fitted
}

fn create_slots_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    slots: &SlotBuffers,
) -> wgpu::BindGroup {
    let buffers = [
        &slots.counts,
        &slots.semaphores,
        &slots.opaque_depth,
        &slots.materials,
        &slots.depths,
        &slots.positions,
    ];
    let entries: Vec<_> = buffers
        .iter()
        .enumerate()
        .map(|(i, buffer)| wgpu::BindGroupEntry {
            binding: i as u32,
            resource: buffer.as_entire_binding(),
        })
        .collect();
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("K-Buffer Slots"),
        layout,
        entries: &entries,
    })
}

fn create_resolve_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    uniforms: &wgpu::Buffer,
    slots: &SlotBuffers,
    palette: &wgpu::Buffer,
) -> wgpu::BindGroup {
    let buffers = [
        uniforms,
        &slots.counts,
        &slots.materials,
        &slots.depths,
        &slots.positions,
        palette,
    ];
    let entries: Vec<_> = buffers
        .iter()
        .enumerate()
        .map(|(i, buffer)| wgpu::BindGroupEntry {
            binding: i as u32,
            resource: buffer.as_entire_binding(),
        })
        .collect();
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("K-Buffer Resolve"),
        layout,
        entries: &entries,
    })
}

fn create_clear_bind_group(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    params: &wgpu::Buffer,
    slots: &SlotBuffers,
) -> wgpu::BindGroup {
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("K-Buffer Clear"),
        layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: params.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: slots.opaque_depth.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: slots.depths.as_entire_binding(),
            },
        ],
    })
}

fn create_palette_buffer(device: &wgpu::Device, palette: &MaterialPalette) -> wgpu::Buffer {
    let entries: Vec<GpuMaterial> = palette.entries().iter().map(GpuMaterial::from).collect();
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("K-Buffer Palette"),
        contents: bytemuck::cast_slice(&entries),
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
    })
}

fn create_store_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    shader: &wgpu::ShaderModule,
    primitive: PrimitiveType,
    cull_mode: CullMode,
) -> wgpu::RenderPipeline {
    log::debug!("creating store pipeline for {:?}, cull {:?}", primitive, cull_mode);
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("K-Buffer Store Pipeline"),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: shader,
            entry_point: Some("vs"),
            buffers: &[Vertex3d::LAYOUT],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: shader,
            entry_point: Some("fs"),
            targets: &[],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: primitive.topology(),
            strip_index_format: primitive
                .is_strip()
                .then_some(wgpu::IndexFormat::Uint32),
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: cull_mode.to_wgpu(),
            ..Default::default()
        },
        depth_stencil: Some(wgpu::DepthStencilState {
            format: wgpu::TextureFormat::Depth32Float,
            depth_write_enabled: false,
            depth_compare: wgpu::CompareFunction::Always,
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        }),
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

fn create_resolve_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    shader: &wgpu::ShaderModule,
    format: wgpu::TextureFormat,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("K-Buffer Resolve Pipeline"),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: shader,
            entry_point: Some("vs"),
            buffers: &[],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: shader,
            entry_point: Some("fs"),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: Some(wgpu::BlendState::REPLACE),
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Viewport;
    use crate::drawable::MeshInstance;
    use crate::gpu::HEADLESS_FORMAT;
    use crate::kbuffer::{KBuffer, MaterialRegistry};
    use crate::material::StorePassMaterial;
    use crate::mesh::{MeshData, Transform};
    use crate::target::ImageTarget;
    use glam::Vec3;

    const SIZE: u32 = 64;

    fn camera(width: u32, height: u32) -> Camera {
        Camera::new()
            .orthographic(2.0)
            .clip(0.1, 10.0)
            .viewport(Viewport::full(width, height))
    }

    fn quad(material: StorePassMaterial, z: f32) -> MeshInstance {
        MeshInstance::new("quad", MeshData::quad(2.0, 2.0), material)
            .with_transform(Transform::from_position(Vec3::new(0.0, 0.0, z)))
    }

    /// Headless device, or `None` where the machine has no usable adapter.
    fn headless(width: u32, height: u32) -> Option<GpuContext> {
        match GpuContext::headless(width, height) {
            Ok(gpu) => Some(gpu),
            Err(e) => {
                eprintln!("skipping GPU test: {e}");
                None
            }
        }
    }

    fn render_target(gpu: &GpuContext, width: u32, height: u32) -> wgpu::Texture {
        gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Test Target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: HEADLESS_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        })
    }

    /// Row-major RGBA8 pixels of `texture`.
    fn read_back(gpu: &GpuContext, texture: &wgpu::Texture) -> Vec<[u8; 4]> {
        let (width, height) = (texture.width(), texture.height());
        let padded_row = (width * 4).div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Test Readback"),
            size: padded_row as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            texture.size(),
        );
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        gpu.device.poll(wgpu::PollType::wait_indefinitely()).unwrap();
        rx.recv().unwrap().unwrap();

        let data = slice.get_mapped_range();
        data.chunks(padded_row as usize)
            .flat_map(|row| row[..width as usize * 4].chunks_exact(4))
            .map(|p| [p[0], p[1], p[2], p[3]])
            .collect()
    }

    /// Draws `quads` on both backends and returns (gpu, software) pixels.
    fn render_both(
        gpu: &GpuContext,
        config: KBufferConfig,
        quads: &mut [MeshInstance],
        background: Color,
    ) -> (Vec<[u8; 4]>, Vec<[u8; 4]>) {
        let (width, height) = (config.width, config.height);
        let cam = camera(width, height);

        let mut kbuffer = KBuffer::from_config(config.clone());
        let mut image = ImageTarget::new(width, height);
        kbuffer.clear_pass();
        for q in quads.iter() {
            kbuffer.draw(q, Some(&cam));
        }
        kbuffer.resolve(&mut image, true, background, Some(&cam));

        let mut gpu_kbuffer = GpuKBuffer::new(gpu, config);
        let texture = render_target(gpu, width, height);
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        gpu_kbuffer.clear_pass(gpu);
        for q in quads.iter_mut() {
            q.upload(gpu);
            gpu_kbuffer.draw(gpu, &*q, Some(&cam));
        }
        gpu_kbuffer.resolve(gpu, &view, HEADLESS_FORMAT, true, background, Some(&cam));
        assert_eq!(gpu_kbuffer.phase(), FramePhase::Resolved);

        let software = image.pixels().iter().map(|c| c.to_rgba8()).collect();
        (read_back(gpu, &texture), software)
    }

    fn assert_close(gpu: [u8; 4], software: [u8; 4]) {
        for (g, s) in gpu.iter().zip(software) {
            assert!(g.abs_diff(s) <= 2, "GPU {gpu:?} differs from software {software:?}");
        }
    }

    #[test]
    fn uniform_blocks_match_shader_layouts() {
        assert_eq!(std::mem::size_of::<DrawUniforms>(), 96);
        assert_eq!(std::mem::size_of::<ResolveUniforms>(), 48);
        assert_eq!(std::mem::size_of::<ClearUniforms>(), 16);
        assert_eq!(std::mem::size_of::<GpuMaterial>(), 48);
    }

    #[test]
    fn shaders_parse_and_validate() {
        let shaders = [
            ("store", include_str!("../shaders/kbuffer_store.wgsl")),
            ("resolve", include_str!("../shaders/kbuffer_resolve.wgsl")),
            ("clear", include_str!("../shaders/kbuffer_clear.wgsl")),
        ];
        for (name, source) in shaders {
            let module = naga::front::wgsl::parse_str(source)
                .unwrap_or_else(|e| panic!("{name} shader: {}", e.emit_to_string(source)));
            naga::valid::Validator::new(
                naga::valid::ValidationFlags::all(),
                naga::valid::Capabilities::all(),
            )
            .validate(&module)
            .unwrap_or_else(|e| panic!("{name} shader: {e:?}"));
        }
    }

    #[test]
    fn gpu_resolve_matches_the_software_backend() {
        let Some(gpu) = headless(SIZE, SIZE) else {
            return;
        };
        let registry = MaterialRegistry::new();
        let mut quads = [
            quad(StorePassMaterial::new(&registry).base_color(Color::RED), -5.0),
            quad(
                StorePassMaterial::new(&registry).translucent(Color::BLUE.with_alpha(0.5), 1.0),
                -2.0,
            ),
        ];
        let config = KBufferConfig {
            material_capacity: registry.count(),
            ..KBufferConfig::new(SIZE, SIZE, 4)
        };

        let (gpu_pixels, software) = render_both(&gpu, config, &mut quads, Color::WHITE);
        let center = (SIZE / 2 * SIZE + SIZE / 2) as usize;
        assert_eq!(software[center], [128, 0, 128, 255]);
        assert_close(gpu_pixels[center], software[center]);
        assert_close(gpu_pixels[0], software[0]);
    }

    #[test]
    fn gpu_keep_nearest_keeps_the_nearest_fragment() {
        let Some(gpu) = headless(SIZE, SIZE) else {
            return;
        };
        let registry = MaterialRegistry::new();
        // Farthest first, so every later draw overflows K = 1.
        let mut quads = [
            quad(StorePassMaterial::new(&registry).base_color(Color::RED.with_alpha(0.5)), -6.0),
            quad(StorePassMaterial::new(&registry).base_color(Color::GREEN.with_alpha(0.5)), -4.0),
            quad(StorePassMaterial::new(&registry).base_color(Color::BLUE.with_alpha(0.5)), -2.0),
        ];
        let config = KBufferConfig {
            material_capacity: registry.count(),
            overflow: OverflowPolicy::KeepNearest,
            ..KBufferConfig::new(SIZE, SIZE, 1)
        };

        let (gpu_pixels, software) = render_both(&gpu, config, &mut quads, Color::BLACK);
        let center = (SIZE / 2 * SIZE + SIZE / 2) as usize;
        assert_eq!(software[center], [0, 0, 128, 255]);
        assert_close(gpu_pixels[center], software[center]);
    }

    #[test]
    fn config_size_is_kept_apart_from_the_surface_size() {
        let Some(gpu) = headless(SIZE, SIZE) else {
            return;
        };
        let registry = MaterialRegistry::new();
        let mut quads = [quad(StorePassMaterial::new(&registry).base_color(Color::RED), -5.0)];
        let config = KBufferConfig::new(32, 16, 2);

        let kbuffer = GpuKBuffer::new(&gpu, config.clone());
        assert_eq!((kbuffer.config().width, kbuffer.config().height), (32, 16));

        let (gpu_pixels, software) = render_both(&gpu, config, &mut quads, Color::BLACK);
        assert_eq!(gpu_pixels.len(), 32 * 16);
        assert_close(gpu_pixels[8 * 32 + 16], software[8 * 32 + 16]);
    }

    #[test]
    fn gpu_reconfiguration_mid_frame_returns_to_idle() {
        let Some(gpu) = headless(SIZE, SIZE) else {
            return;
        };
        let registry = MaterialRegistry::new();
        let mut q = quad(StorePassMaterial::new(&registry).base_color(Color::RED), -5.0);
        q.upload(&gpu);
        let cam = camera(SIZE, SIZE);
        let mut kbuffer = GpuKBuffer::new(&gpu, KBufferConfig::new(SIZE, SIZE, 4));

        kbuffer.clear_pass(&gpu);
        kbuffer.draw(&gpu, &q, Some(&cam));
        assert_eq!(kbuffer.phase(), FramePhase::Stored(1));
        kbuffer.set_k(2);
        assert_eq!(kbuffer.phase(), FramePhase::Idle);
        kbuffer.clear_pass(&gpu);
        assert_eq!(kbuffer.allocated_k(), 2);

        kbuffer.draw(&gpu, &q, Some(&cam));
        kbuffer.set_store_pass_material_count(registry.count() + 2);
        assert_eq!(kbuffer.phase(), FramePhase::Idle);
        assert_eq!(kbuffer.store_pass_material_count(), 3);
        kbuffer.set_store_pass_material_count(-1);
        assert_eq!(kbuffer.config().material_capacity, 1);
    }

    #[test]
    fn k_is_fitted_to_the_binding_limit() {
        // One slot layer of 10x10 positions is 1200 bytes.
        assert_eq!(fit_k(16, 10, 10, 1200 * 16), 16);
        assert_eq!(fit_k(16, 10, 10, 1200 * 3 + 5), 3);
        assert_eq!(fit_k(8, 10, 10, 10), 1);
    }
}
