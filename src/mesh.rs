//! Vertex data, primitive topology, GPU meshes and transforms.
//!
//! Geometry lives on the CPU as [`MeshData`] so the software store pass can
//! rasterize it directly; [`Mesh`] is the same data uploaded for the GPU
//! K-Buffer.
//!
//! ```
//! use kbuffer::{MeshData, PrimitiveType, Transform, Vec3, Quat};
//!
//! let ball = MeshData::sphere(32, 16);
//! assert_eq!(ball.primitive, PrimitiveType::TriangleList);
//!
//! let transform = Transform::new()
//!     .position(Vec3::new(-0.75, 0.001, 0.0))
//!     .rotation(Quat::from_rotation_y(-std::f32::consts::FRAC_PI_2));
//! ```
//!
//! # Vertex Layout
//!
//! | Attribute | Format    | Offset | Shader Location |
//! |-----------|-----------|--------|-----------------|
//! | position  | Float32x3 | 0      | 0               |
//! | normal    | Float32x3 | 12     | 1               |
//! | uv        | Float32x2 | 24     | 2               |

use glam::{Mat4, Quat, Vec3};

use crate::gpu::GpuContext;

/// A vertex with position, normal and texture coordinates (32 bytes).
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex3d {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex3d {
    /// Vertex buffer layout matching the store pass vertex shader.
    pub const LAYOUT: wgpu::VertexBufferLayout<'static> = wgpu::VertexBufferLayout {
        array_stride: std::mem::size_of::<Vertex3d>() as u64,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &[
            // position
            wgpu::VertexAttribute {
                offset: 0,
                shader_location: 0,
                format: wgpu::VertexFormat::Float32x3,
            },
            // normal
            wgpu::VertexAttribute {
                offset: 12,
                shader_location: 1,
                format: wgpu::VertexFormat::Float32x3,
            },
            // uv
            wgpu::VertexAttribute {
                offset: 24,
                shader_location: 2,
                format: wgpu::VertexFormat::Float32x2,
            },
        ],
    };

    pub fn new(position: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            uv,
        }
    }
}

/// How consecutive indices are assembled into primitives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

impl PrimitiveType {
    pub fn topology(self) -> wgpu::PrimitiveTopology {
        match self {
            PrimitiveType::PointList => wgpu::PrimitiveTopology::PointList,
            PrimitiveType::LineList => wgpu::PrimitiveTopology::LineList,
            PrimitiveType::LineStrip => wgpu::PrimitiveTopology::LineStrip,
            PrimitiveType::TriangleList => wgpu::PrimitiveTopology::TriangleList,
            PrimitiveType::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
        }
    }

    pub fn is_strip(self) -> bool {
        matches!(self, PrimitiveType::LineStrip | PrimitiveType::TriangleStrip)
    }
}

/// CPU-side geometry.
///
/// An empty `indices` list draws the vertices in order.
#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex3d>,
    pub indices: Vec<u32>,
    pub primitive: PrimitiveType,
}

impl MeshData {
    pub fn new(vertices: Vec<Vertex3d>, indices: Vec<u32>, primitive: PrimitiveType) -> Self {
        Self {
            vertices,
            indices,
            primitive,
        }
    }

    pub fn triangles(vertices: Vec<Vertex3d>, indices: Vec<u32>) -> Self {
        Self::new(vertices, indices, PrimitiveType::TriangleList)
    }

    pub fn is_indexed(&self) -> bool {
        !self.indices.is_empty()
    }

    /// Number of elements the draw walks: indices if present, vertices otherwise.
    pub fn element_count(&self) -> usize {
        if self.is_indexed() {
            self.indices.len()
        } else {
            self.vertices.len()
        }
    }

    /// Vertex index of element `i`.
    pub fn element(&self, i: usize) -> u32 {
        if self.is_indexed() {
            self.indices[i]
        } else {
            i as u32
        }
    }

    /// Axis-aligned bounds as `(min, max)`.
    pub fn bounds(&self) -> (Vec3, Vec3) {
        self.vertices.iter().fold(
            (Vec3::splat(f32::INFINITY), Vec3::splat(f32::NEG_INFINITY)),
            |(min, max), v| {
                let p = Vec3::from(v.position);
                (min.min(p), max.max(p))
            },
        )
    }

    pub fn center(&self) -> Vec3 {
        let (min, max) = self.bounds();
        (min + max) * 0.5
    }

    pub fn translate(&mut self, offset: Vec3) {
        for v in &mut self.vertices {
            v.position = (Vec3::from(v.position) + offset).into();
        }
    }

    /// Moves the bounding box center to the origin and scales the largest
    /// extent to 1.
    pub fn normalize(&mut self) {
        let center = self.center();
        self.translate(-center);
        let (min, max) = self.bounds();
        let size = max - min;
        let max_dim = size.x.max(size.y).max(size.z);
        if max_dim > 0.0 {
            for v in &mut self.vertices {
                v.position = (Vec3::from(v.position) / max_dim).into();
            }
        }
    }

    /// Quad of `width` x `height` in the XY plane, facing +Z.
    pub fn quad(width: f32, height: f32) -> Self {
        let (hw, hh) = (width * 0.5, height * 0.5);
        let n = [0.0, 0.0, 1.0];
        let vertices = vec![
            Vertex3d::new([-hw, -hh, 0.0], n, [0.0, 1.0]),
            Vertex3d::new([hw, -hh, 0.0], n, [1.0, 1.0]),
            Vertex3d::new([hw, hh, 0.0], n, [1.0, 0.0]),
            Vertex3d::new([-hw, hh, 0.0], n, [0.0, 0.0]),
        ];
        Self::triangles(vertices, vec![0, 1, 2, 2, 3, 0])
    }

    /// Square of side `size` in the XZ plane, facing +Y.
    pub fn plane(size: f32) -> Self {
        let half = size * 0.5;
        let n = [0.0, 1.0, 0.0];
        let vertices = vec![
            Vertex3d::new([-half, 0.0, -half], n, [0.0, 0.0]),
            Vertex3d::new([-half, 0.0, half], n, [0.0, 1.0]),
            Vertex3d::new([half, 0.0, half], n, [1.0, 1.0]),
            Vertex3d::new([half, 0.0, -half], n, [1.0, 0.0]),
        ];
        Self::triangles(vertices, vec![0, 1, 2, 2, 3, 0])
    }

    /// Unit cube centered at the origin.
    pub fn cube() -> Self {
        // Each face has its own vertices for correct normals
        #[rustfmt::skip]
        let vertices = vec![
            // Front face (Z+)
            Vertex3d::new([-0.5, -0.5,  0.5], [ 0.0,  0.0,  1.0], [0.0, 0.0]),
            Vertex3d::new([ 0.5, -0.5,  0.5], [ 0.0,  0.0,  1.0], [1.0, 0.0]),
            Vertex3d::new([ 0.5,  0.5,  0.5], [ 0.0,  0.0,  1.0], [1.0, 1.0]),
            Vertex3d::new([-0.5,  0.5,  0.5], [ 0.0,  0.0,  1.0], [0.0, 1.0]),
            // Back face (Z-)
            Vertex3d::new([ 0.5, -0.5, -0.5], [ 0.0,  0.0, -1.0], [0.0, 0.0]),
            Vertex3d::new([-0.5, -0.5, -0.5], [ 0.0,  0.0, -1.0], [1.0, 0.0]),
            Vertex3d::new([-0.5,  0.5, -0.5], [ 0.0,  0.0, -1.0], [1.0, 1.0]),
            Vertex3d::new([ 0.5,  0.5, -0.5], [ 0.0,  0.0, -1.0], [0.0, 1.0]),
            // Top face (Y+)
            Vertex3d::new([-0.5,  0.5,  0.5], [ 0.0,  1.0,  0.0], [0.0, 0.0]),
            Vertex3d::new([ 0.5,  0.5,  0.5], [ 0.0,  1.0,  0.0], [1.0, 0.0]),
            Vertex3d::new([ 0.5,  0.5, -0.5], [ 0.0,  1.0,  0.0], [1.0, 1.0]),
            Vertex3d::new([-0.5,  0.5, -0.5], [ 0.0,  1.0,  0.0], [0.0, 1.0]),
            // Bottom face (Y-)
            Vertex3d::new([-0.5, -0.5, -0.5], [ 0.0, -1.0,  0.0], [0.0, 0.0]),
            Vertex3d::new([ 0.5, -0.5, -0.5], [ 0.0, -1.0,  0.0], [1.0, 0.0]),
            Vertex3d::new([ 0.5, -0.5,  0.5], [ 0.0, -1.0,  0.0], [1.0, 1.0]),
            Vertex3d::new([-0.5, -0.5,  0.5], [ 0.0, -1.0,  0.0], [0.0, 1.0]),
            // Right face (X+)
            Vertex3d::new([ 0.5, -0.5,  0.5], [ 1.0,  0.0,  0.0], [0.0, 0.0]),
            Vertex3d::new([ 0.5, -0.5, -0.5], [ 1.0,  0.0,  0.0], [1.0, 0.0]),
            Vertex3d::new([ 0.5,  0.5, -0.5], [ 1.0,  0.0,  0.0], [1.0, 1.0]),
            Vertex3d::new([ 0.5,  0.5,  0.5], [ 1.0,  0.0,  0.0], [0.0, 1.0]),
            // Left face (X-)
            Vertex3d::new([-0.5, -0.5, -0.5], [-1.0,  0.0,  0.0], [0.0, 0.0]),
            Vertex3d::new([-0.5, -0.5,  0.5], [-1.0,  0.0,  0.0], [1.0, 0.0]),
            Vertex3d::new([-0.5,  0.5,  0.5], [-1.0,  0.0,  0.0], [1.0, 1.0]),
            Vertex3d::new([-0.5,  0.5, -0.5], [-1.0,  0.0,  0.0], [0.0, 1.0]),
        ];

        #[rustfmt::skip]
        let indices: Vec<u32> = vec![
            0,  1,  2,  2,  3,  0,  // front
            4,  5,  6,  6,  7,  4,  // back
            8,  9,  10, 10, 11, 8,  // top
            12, 13, 14, 14, 15, 12, // bottom
            16, 17, 18, 18, 19, 16, // right
            20, 21, 22, 22, 23, 20, // left
        ];

        Self::triangles(vertices, indices)
    }

    /// UV sphere of diameter 1.
    pub fn sphere(segments: u32, rings: u32) -> Self {
        let segments = segments.max(3);
        let rings = rings.max(2);
        let mut vertices = Vec::with_capacity(((rings + 1) * (segments + 1)) as usize);
        let mut indices = Vec::with_capacity((rings * segments * 6) as usize);

        for ring in 0..=rings {
            let phi = std::f32::consts::PI * ring as f32 / rings as f32;
            let y = phi.cos();
            let ring_radius = phi.sin();

            for seg in 0..=segments {
                let theta = 2.0 * std::f32::consts::PI * seg as f32 / segments as f32;
                let x = ring_radius * theta.cos();
                let z = ring_radius * theta.sin();
                let uv = [seg as f32 / segments as f32, ring as f32 / rings as f32];
                vertices.push(Vertex3d::new([x * 0.5, y * 0.5, z * 0.5], [x, y, z], uv));
            }
        }

        for ring in 0..rings {
            for seg in 0..segments {
                let current = ring * (segments + 1) + seg;
                let next = current + segments + 1;
                indices.extend_from_slice(&[current, next, current + 1]);
                indices.extend_from_slice(&[current + 1, next, next + 1]);
            }
        }

        Self::triangles(vertices, indices)
    }

    /// Uploads to the GPU.
    pub fn upload(&self, gpu: &GpuContext) -> Mesh {
        Mesh::new(gpu, self)
    }
}

/// GPU-resident copy of a [`MeshData`].
#[derive(Debug)]
pub struct Mesh {
    pub(crate) vertex_buffer: wgpu::Buffer,
    pub(crate) index_buffer: Option<wgpu::Buffer>,
    pub(crate) element_count: u32,
    pub(crate) primitive: PrimitiveType,
}

impl Mesh {
    pub fn new(gpu: &GpuContext, data: &MeshData) -> Self {
        use wgpu::util::DeviceExt;

        let vertex_buffer = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Mesh Vertex Buffer"),
                contents: bytemuck::cast_slice(&data.vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });

        let index_buffer = data.is_indexed().then(|| {
            gpu.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("Mesh Index Buffer"),
                    contents: bytemuck::cast_slice(&data.indices),
                    usage: wgpu::BufferUsages::INDEX,
                })
        });

        Self {
            vertex_buffer,
            index_buffer,
            element_count: data.element_count() as u32,
            primitive: data.primitive,
        }
    }

    pub fn primitive(&self) -> PrimitiveType {
        self.primitive
    }

    pub fn element_count(&self) -> u32 {
        self.element_count
    }
}

/// Position, rotation and scale of a drawable.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    pub fn position(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    pub fn rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    pub fn uniform_scale(mut self, scale: f32) -> Self {
        self.scale = Vec3::splat(scale);
        self
    }

    /// Model matrix: scale, then rotate, then translate.
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }
}
