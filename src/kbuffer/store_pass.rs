use std::sync::atomic::{AtomicU32, Ordering};

use glam::Mat4;
use rayon::prelude::*;

use super::fragment_store::{FAR_DEPTH, FragmentRecord, FragmentStore};
use super::frame::FrameStats;
use super::raster::{ClipVertex, Rasterizer};
use crate::mesh::{MeshData, PrimitiveType};

/// Depth of the nearest opaque surface per pixel.
pub struct DepthAttachment {
    depth: Vec<AtomicU32>,
}

impl DepthAttachment {
    pub fn new(pixels: usize) -> Self {
        Self {
            depth: (0..pixels)
                .map(|_| AtomicU32::new(FAR_DEPTH.to_bits()))
                .collect(),
        }
    }

    pub fn clear(&self) {
        let far = FAR_DEPTH.to_bits();
        self.depth
            .par_iter()
            .for_each(|d| d.store(far, Ordering::Relaxed));
    }

    pub fn len(&self) -> usize {
        self.depth.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depth.is_empty()
    }

    pub fn depth_at(&self, pixel: usize) -> f32 {
        f32::from_bits(self.depth[pixel].load(Ordering::Relaxed))
    }

    /// Less-or-equal depth test.
    pub fn test(&self, pixel: usize, depth: f32) -> bool {
        depth <= self.depth_at(pixel)
    }

    /// Keeps the nearer of the stored and the given depth. Depths are
    /// non-negative, so their bit patterns order like the values.
    pub fn write(&self, pixel: usize, depth: f32) {
        self.depth[pixel].fetch_min(depth.to_bits(), Ordering::Relaxed);
    }
}

/// Everything a draw needs besides the geometry.
pub(crate) struct StorePass<'a> {
    pub store: &'a FragmentStore,
    pub depth: &'a DepthAttachment,
    pub raster: Rasterizer,
    pub depth_test: bool,
    pub material: u32,
    pub opaque: bool,
}

impl StorePass<'_> {
    /// Rasterizes `data` in parallel, one task per primitive, and claims a
    /// slot for every fragment that survives the depth test.
    pub fn run(&self, data: &MeshData, model_view: Mat4, projection: Mat4) -> FrameStats {
        let vertices: Vec<ClipVertex> = data
            .vertices
            .par_iter()
            .map(|v| {
                let view = model_view.transform_point3(glam::Vec3::from(v.position));
                ClipVertex {
                    clip: projection * view.extend(1.0),
                    view,
                }
            })
            .collect();

        let count = data.element_count();
        let vertex = |i: usize| vertices[data.element(i) as usize];
        let primitives = match data.primitive {
            PrimitiveType::PointList => count,
            PrimitiveType::LineList => count / 2,
            PrimitiveType::LineStrip => count.saturating_sub(1),
            PrimitiveType::TriangleList => count / 3,
            PrimitiveType::TriangleStrip => count.saturating_sub(2),
        };

        (0..primitives)
            .into_par_iter()
            .map(|i| {
                let mut stats = FrameStats::default();
                let mut emit = |f: super::raster::RasterFragment| {
                    let Some(pixel) = self.store.pixel_index(f.x, f.y) else {
                        return;
                    };
                    if self.depth_test {
                        if !self.depth.test(pixel, f.depth) {
                            stats.fragments_occluded += 1;
                            return;
                        }
                        if self.opaque {
                            self.depth.write(pixel, f.depth);
                        }
                    }
                    let record = FragmentRecord {
                        material: self.material,
                        depth: f.depth,
                        position: f.position,
                    };
                    if self.store.try_claim_slot(pixel, &record) {
                        stats.fragments_stored += 1;
                    }
                };

                match data.primitive {
                    PrimitiveType::PointList => self.raster.point(&vertex(i), &mut emit),
                    PrimitiveType::LineList => {
                        self.raster
                            .line(&vertex(2 * i), &vertex(2 * i + 1), &mut emit)
                    }
                    PrimitiveType::LineStrip => {
                        self.raster.line(&vertex(i), &vertex(i + 1), &mut emit)
                    }
                    PrimitiveType::TriangleList => self.raster.triangle(
                        [vertex(3 * i), vertex(3 * i + 1), vertex(3 * i + 2)],
                        &mut emit,
                    ),
                    // Odd triangles of a strip swap their first two vertices to keep the winding.
                    PrimitiveType::TriangleStrip if i % 2 == 1 => self
                        .raster
                        .triangle([vertex(i + 1), vertex(i), vertex(i + 2)], &mut emit),
                    PrimitiveType::TriangleStrip => self
                        .raster
                        .triangle([vertex(i), vertex(i + 1), vertex(i + 2)], &mut emit),
                }
                stats
            })
            .reduce(FrameStats::default, |a, b| a + b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Viewport;
    use crate::config::CullMode;

    fn ortho() -> Mat4 {
        Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, 0.1, 10.0)
    }

    fn pass<'a>(
        store: &'a FragmentStore,
        depth: &'a DepthAttachment,
        material: u32,
        opaque: bool,
    ) -> StorePass<'a> {
        StorePass {
            store,
            depth,
            raster: Rasterizer::new(Viewport::full(8, 8), 8, 8, CullMode::None),
            depth_test: true,
            material,
            opaque,
        }
    }

    fn quad_at(z: f32) -> Mat4 {
        Mat4::from_translation(glam::Vec3::new(0.0, 0.0, z))
    }

    #[test]
    fn full_quad_stores_one_fragment_per_pixel() {
        let store = FragmentStore::new(8, 8, 4);
        let depth = DepthAttachment::new(64);
        let stats = pass(&store, &depth, 0, false).run(&MeshData::quad(2.0, 2.0), quad_at(-5.0), ortho());

        assert_eq!(stats.fragments_stored, 64);
        assert!((0..64).all(|p| store.occupancy(p) == 1));
    }

    #[test]
    fn opaque_surface_occludes_later_draws_behind_it() {
        let store = FragmentStore::new(8, 8, 4);
        let depth = DepthAttachment::new(64);
        let quad = MeshData::quad(2.0, 2.0);
        pass(&store, &depth, 0, true).run(&quad, quad_at(-2.0), ortho());
        let behind = pass(&store, &depth, 1, false).run(&quad, quad_at(-6.0), ortho());

        assert_eq!(behind.fragments_stored, 0);
        assert_eq!(behind.fragments_occluded, 64);
        assert!(depth.depth_at(0) < 0.5);
    }

    #[test]
    fn triangle_strip_covers_like_a_list() {
        let store = FragmentStore::new(8, 8, 4);
        let depth = DepthAttachment::new(64);
        let mut strip = MeshData::quad(2.0, 2.0);
        strip.indices = vec![0, 1, 3, 2];
        strip.primitive = PrimitiveType::TriangleStrip;

        let stats = pass(&store, &depth, 0, false).run(&strip, quad_at(-5.0), ortho());
        assert_eq!(stats.fragments_stored, 64);
    }
}
