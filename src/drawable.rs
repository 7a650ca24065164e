//! Things the K-Buffer can draw.
//!
//! A drawable is assembled from three capabilities: a [`Transform`], a
//! [`StorePassMaterial`] and [`MeshData`]. [`MeshInstance`] is the stock
//! implementation; anything else that provides the three traits can be
//! drawn as well.

use glam::Mat4;

use crate::material::StorePassMaterial;
use crate::mesh::{Mesh, MeshData, PrimitiveType, Transform};

pub trait HasTransform {
    fn transform(&self) -> &Transform;

    fn model_matrix(&self) -> Mat4 {
        self.transform().matrix()
    }
}

pub trait HasMaterial {
    fn material(&self) -> &StorePassMaterial;
}

pub trait HasVertexData {
    fn vertex_data(&self) -> &MeshData;
}

pub trait Drawable: HasTransform + HasMaterial + HasVertexData {
    fn is_enabled(&self) -> bool {
        true
    }

    /// Called right before the drawable is stored.
    fn on_draw_begin(&self) {}

    /// Called once the drawable has been stored.
    fn on_draw_end(&self) {}

    /// Uploaded copy of the vertex data, required by the GPU K-Buffer.
    fn gpu_mesh(&self) -> Option<&Mesh> {
        None
    }
}

/// Why a draw call was refused.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DrawError {
    #[error(
        "Count of indices do not fit with the primitive ({count} for {primitive:?}). Object will not be drawn."
    )]
    CountMismatch {
        count: usize,
        primitive: PrimitiveType,
    },
    #[error("Index {index} is out of range for {vertices} vertices. Object will not be drawn.")]
    IndexOutOfRange { index: u32, vertices: usize },
    #[error("No valid camera to use for rendering. Object will not be drawn.")]
    NoCamera,
    #[error("Drawable has no GPU mesh. Object will not be drawn.")]
    NotUploaded,
}

/// Whether `count` elements assemble into whole primitives of `primitive`.
pub fn check_count_primitive(primitive: PrimitiveType, count: usize) -> bool {
    match primitive {
        PrimitiveType::PointList => count >= 1,
        PrimitiveType::LineList => count >= 2 && count % 2 == 0,
        PrimitiveType::LineStrip => count >= 2,
        PrimitiveType::TriangleList => count >= 3 && count % 3 == 0,
        PrimitiveType::TriangleStrip => count >= 3,
    }
}

/// Checks element counts and index ranges before a draw.
pub fn validate_vertex_data(data: &MeshData) -> Result<(), DrawError> {
    let count = data.element_count();
    if !check_count_primitive(data.primitive, count) {
        return Err(DrawError::CountMismatch {
            count,
            primitive: data.primitive,
        });
    }
    if let Some(&index) = data
        .indices
        .iter()
        .find(|&&i| i as usize >= data.vertices.len())
    {
        return Err(DrawError::IndexOutOfRange {
            index,
            vertices: data.vertices.len(),
        });
    }
    Ok(())
}

/// Mesh data placed in the scene with a store-pass material.
pub struct MeshInstance {
    pub name: String,
    pub data: MeshData,
    pub transform: Transform,
    pub material: StorePassMaterial,
    pub enabled: bool,
    mesh: Option<Mesh>,
}

impl MeshInstance {
    pub fn new(name: impl Into<String>, data: MeshData, material: StorePassMaterial) -> Self {
        Self {
            name: name.into(),
            data,
            transform: Transform::default(),
            material,
            enabled: true,
            mesh: None,
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Uploads the vertex data so the GPU K-Buffer can draw it.
    pub fn upload(&mut self, gpu: &crate::gpu::GpuContext) {
        self.mesh = Some(self.data.upload(gpu));
    }
}

impl HasTransform for MeshInstance {
    fn transform(&self) -> &Transform {
        &self.transform
    }
}

impl HasMaterial for MeshInstance {
    fn material(&self) -> &StorePassMaterial {
        &self.material
    }
}

impl HasVertexData for MeshInstance {
    fn vertex_data(&self) -> &MeshData {
        &self.data
    }
}

impl Drawable for MeshInstance {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn on_draw_begin(&self) {
        log::trace!("drawing '{}'", self.name);
    }

    fn gpu_mesh(&self) -> Option<&Mesh> {
        self.mesh.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Vertex3d;

    #[test]
    fn count_rules_per_primitive() {
        assert!(check_count_primitive(PrimitiveType::PointList, 1));
        assert!(!check_count_primitive(PrimitiveType::PointList, 0));
        assert!(check_count_primitive(PrimitiveType::LineList, 4));
        assert!(!check_count_primitive(PrimitiveType::LineList, 3));
        assert!(check_count_primitive(PrimitiveType::LineStrip, 3));
        assert!(!check_count_primitive(PrimitiveType::LineStrip, 1));
        assert!(check_count_primitive(PrimitiveType::TriangleList, 6));
        assert!(!check_count_primitive(PrimitiveType::TriangleList, 4));
        assert!(check_count_primitive(PrimitiveType::TriangleStrip, 4));
        assert!(!check_count_primitive(PrimitiveType::TriangleStrip, 2));
    }

    #[test]
    fn rejects_out_of_range_indices() {
        let v = Vertex3d::new([0.0; 3], [0.0, 0.0, 1.0], [0.0; 2]);
        let data = MeshData::triangles(vec![v; 3], vec![0, 1, 3]);
        assert_eq!(
            validate_vertex_data(&data),
            Err(DrawError::IndexOutOfRange {
                index: 3,
                vertices: 3
            })
        );
    }

    #[test]
    fn quad_is_valid() {
        assert_eq!(validate_vertex_data(&MeshData::quad(1.0, 1.0)), Ok(()));
    }
}
