//! Model loading into [`MeshData`].
//!
//! ```no_run
//! use kbuffer::GeometryLoader;
//!
//! let model = GeometryLoader::from_file("models/dragon.stl")
//!     .centered()
//!     .normalized()
//!     .build()?;
//! # Ok::<(), kbuffer::GeometryError>(())
//! ```
//!
//! | Format | Extensions | Notes |
//! |--------|------------|-------|
//! | STL    | `.stl`     | Binary and ASCII, no UV coordinates |

use std::io::{Read, Seek};
use std::path::Path;

use glam::{Quat, Vec3};

use crate::mesh::{MeshData, Vertex3d};

#[derive(thiserror::Error, Debug)]
pub enum GeometryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unknown geometry format: '{0}'")]
    UnknownFormat(String),
    #[error("STL parse error: {0}")]
    Parse(String),
    #[error("model has no triangles")]
    Empty,
}

/// Reads an STL file into flat-shaded triangles.
pub fn load_stl(path: impl AsRef<Path>) -> Result<MeshData, GeometryError> {
    let file = std::fs::File::open(path.as_ref())?;
    parse_stl(&mut std::io::BufReader::new(file))
}

pub fn parse_stl<R: Read + Seek>(reader: &mut R) -> Result<MeshData, GeometryError> {
    let stl = stl_io::read_stl(reader).map_err(|e| GeometryError::Parse(e.to_string()))?;
    if stl.faces.is_empty() {
        return Err(GeometryError::Empty);
    }

    let mut vertices = Vec::with_capacity(stl.faces.len() * 3);
    for face in &stl.faces {
        let normal: [f32; 3] = face.normal.into();
        for &index in &face.vertices {
            let vertex = stl
                .vertices
                .get(index)
                .ok_or_else(|| GeometryError::Parse(format!("vertex {index} out of range")))?;
            vertices.push(Vertex3d::new((*vertex).into(), normal, [0.0, 0.0]));
        }
    }
    let indices = (0..vertices.len() as u32).collect();
    Ok(MeshData::triangles(vertices, indices))
}

pub fn from_stl_bytes(bytes: &[u8]) -> Result<MeshData, GeometryError> {
    parse_stl(&mut std::io::Cursor::new(bytes))
}

/// Loads a file by extension and applies optional fix-ups.
///
/// Steps run in a fixed order: center, rotate, normalize, scale, smooth
/// normals, translate.
#[derive(Clone, Debug)]
pub struct GeometryLoader {
    source: Source,
    center: bool,
    normalize: bool,
    smooth_normals: bool,
    scale: Option<f32>,
    rotation: Option<Quat>,
    translation: Option<Vec3>,
}

#[derive(Clone, Debug)]
enum Source {
    File(std::path::PathBuf),
    Bytes(Vec<u8>),
    Data(MeshData),
}

impl GeometryLoader {
    fn with_source(source: Source) -> Self {
        Self {
            source,
            center: false,
            normalize: false,
            smooth_normals: false,
            scale: None,
            rotation: None,
            translation: None,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Self {
        Self::with_source(Source::File(path.as_ref().to_path_buf()))
    }

    pub fn from_stl_bytes(bytes: &[u8]) -> Self {
        Self::with_source(Source::Bytes(bytes.to_vec()))
    }

    pub fn from_data(data: MeshData) -> Self {
        Self::with_source(Source::Data(data))
    }

    pub fn centered(mut self) -> Self {
        self.center = true;
        self
    }

    /// Largest extent becomes 1.
    pub fn normalized(mut self) -> Self {
        self.normalize = true;
        self
    }

    pub fn smooth_normals(mut self) -> Self {
        self.smooth_normals = true;
        self
    }

    pub fn scaled(mut self, factor: f32) -> Self {
        self.scale = Some(factor);
        self
    }

    /// Z-up to Y-up.
    pub fn upright(mut self) -> Self {
        self.rotation = Some(Quat::from_rotation_x(-std::f32::consts::FRAC_PI_2));
        self
    }

    pub fn rotated_by(mut self, rotation: Quat) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn translated(mut self, offset: Vec3) -> Self {
        self.translation = Some(offset);
        self
    }

    pub fn build(self) -> Result<MeshData, GeometryError> {
        let mut data = match self.source {
            Source::File(path) => {
                let ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_lowercase)
                    .unwrap_or_default();
                match ext.as_str() {
                    "stl" => load_stl(&path)?,
                    _ => return Err(GeometryError::UnknownFormat(ext)),
                }
            }
            Source::Bytes(bytes) => from_stl_bytes(&bytes)?,
            Source::Data(data) => data,
        };

        if self.center {
            let center = data.center();
            data.translate(-center);
        }
        if let Some(rotation) = self.rotation {
            rotate(&mut data, rotation);
        }
        if self.normalize {
            data.normalize();
        }
        if let Some(factor) = self.scale {
            for v in &mut data.vertices {
                v.position = (Vec3::from(v.position) * factor).into();
            }
        }
        if self.smooth_normals {
            recalculate_normals(&mut data);
        }
        if let Some(offset) = self.translation {
            data.translate(offset);
        }
        log::debug!(
            "loaded geometry with {} vertices, {} elements",
            data.vertices.len(),
            data.element_count()
        );
        Ok(data)
    }
}

fn rotate(data: &mut MeshData, rotation: Quat) {
    for v in &mut data.vertices {
        v.position = (rotation * Vec3::from(v.position)).into();
        v.normal = (rotation * Vec3::from(v.normal)).into();
    }
}

/// Area-weighted vertex normals from the triangle list.
fn recalculate_normals(data: &mut MeshData) {
    let mut normals = vec![Vec3::ZERO; data.vertices.len()];
    for t in 0..data.element_count() / 3 {
        let [a, b, c] = [
            data.element(3 * t) as usize,
            data.element(3 * t + 1) as usize,
            data.element(3 * t + 2) as usize,
        ];
        let (Some(pa), Some(pb), Some(pc)) = (
            data.vertices.get(a),
            data.vertices.get(b),
            data.vertices.get(c),
        ) else {
            continue;
        };
        let p0 = Vec3::from(pa.position);
        let face = (Vec3::from(pb.position) - p0).cross(Vec3::from(pc.position) - p0);
        for i in [a, b, c] {
            normals[i] += face;
        }
    }
    for (v, n) in data.vertices.iter_mut().zip(normals) {
        v.normal = n.normalize_or_zero().into();
    }
}
