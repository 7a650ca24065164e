//! Scanline-free software rasterizer used by the CPU store pass.
//!
//! Triangles are clipped against the near plane, snapped to 1/256 pixel and
//! filled with integer edge functions sampled at pixel centers. Pixels lying
//! exactly on an edge belong to one side only, so two triangles sharing an
//! edge never both cover a pixel. Depth is interpolated linearly in screen
//! space like a hardware depth buffer; view-space position is interpolated
//! perspective-correctly.

use glam::{Vec3, Vec4};

use crate::camera::Viewport;
use crate::config::CullMode;

const SUBPIXEL: f64 = 256.0;
const HALF_PIXEL: i64 = 128;
/// Screen coordinates are clamped to this many pixels around the origin so
/// edge function products stay well inside `i64`.
const GUARD_BAND: f64 = (1 << 20) as f64;

/// Vertex after the vertex stage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClipVertex {
    pub clip: Vec4,
    /// View-space position carried to the fragment.
    pub view: Vec3,
}

impl ClipVertex {
    fn lerp(self, other: ClipVertex, t: f32) -> Self {
        Self {
            clip: self.clip.lerp(other.clip, t),
            view: self.view.lerp(other.view, t),
        }
    }
}

/// One covered pixel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RasterFragment {
    pub x: u32,
    pub y: u32,
    /// Normalized device depth in `[0, 1]`.
    pub depth: f32,
    pub position: Vec3,
}

#[derive(Clone, Copy, Debug)]
struct ScreenVertex {
    x: f64,
    y: f64,
    z: f32,
    inv_w: f32,
    view_over_w: Vec3,
}

#[derive(Clone, Copy, Debug)]
pub struct Rasterizer {
    viewport: Viewport,
    /// Scissor rectangle `(x0, y0, x1, y1)`, end exclusive.
    bounds: (u32, u32, u32, u32),
    cull: CullMode,
}

fn orient(a: (i64, i64), b: (i64, i64), q: (i64, i64)) -> i64 {
    (b.0 - a.0) * (q.1 - a.1) - (b.1 - a.1) * (q.0 - a.0)
}

/// Ownership of pixels lying exactly on the edge `a -> b`. For any edge
/// exactly one of the two directions owns it.
fn owns_edge(a: (i64, i64), b: (i64, i64)) -> bool {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    dy > 0 || (dy == 0 && dx < 0)
}

fn covers(w: i64, a: (i64, i64), b: (i64, i64)) -> bool {
    w > 0 || (w == 0 && owns_edge(a, b))
}

fn snap(v: f64) -> i64 {
    (v.clamp(-GUARD_BAND, GUARD_BAND) * SUBPIXEL).round() as i64
}

/// Depth test inputs outside `[0, 1]`: beyond the far plane is rejected,
/// anything at or in front of the near plane becomes 0.
fn fragment_depth(z: f32) -> Option<f32> {
    if z > 1.0 {
        None
    } else if z > 0.0 {
        Some(z)
    } else {
        Some(0.0)
    }
}

impl Rasterizer {
    pub fn new(viewport: Viewport, target_width: u32, target_height: u32, cull: CullMode) -> Self {
        Self {
            viewport,
            bounds: viewport.clamp_to(target_width, target_height),
            cull,
        }
    }

    fn to_screen(&self, v: &ClipVertex) -> ScreenVertex {
        let inv_w = 1.0 / v.clip.w;
        let ndc = v.clip.truncate() * inv_w;
        let vp = &self.viewport;
        ScreenVertex {
            x: vp.x as f64 + (ndc.x as f64 * 0.5 + 0.5) * vp.width as f64,
            y: vp.y as f64 + (0.5 - ndc.y as f64 * 0.5) * vp.height as f64,
            z: ndc.z,
            inv_w,
            view_over_w: v.view * inv_w,
        }
    }

    fn in_bounds(&self, x: i64, y: i64) -> bool {
        let (x0, y0, x1, y1) = self.bounds;
        x >= x0 as i64 && x < x1 as i64 && y >= y0 as i64 && y < y1 as i64
    }

    pub fn point(&self, v: &ClipVertex, emit: &mut impl FnMut(RasterFragment)) {
        if v.clip.w <= 0.0 || v.clip.z < 0.0 {
            return;
        }
        let s = self.to_screen(v);
        let (x, y) = (s.x.floor() as i64, s.y.floor() as i64);
        if !self.in_bounds(x, y) {
            return;
        }
        if let Some(depth) = fragment_depth(s.z) {
            emit(RasterFragment {
                x: x as u32,
                y: y as u32,
                depth,
                position: v.view,
            });
        }
    }

    /// Steps one pixel at a time from `a` towards `b`. The end pixel is left
    /// out so strips do not store their joints twice.
    pub fn line(&self, a: &ClipVertex, b: &ClipVertex, emit: &mut impl FnMut(RasterFragment)) {
        let (da, db) = (a.clip.z, b.clip.z);
        if da < 0.0 && db < 0.0 {
            return;
        }
        let (a, b) = if da < 0.0 {
            (a.lerp(*b, da / (da - db)), *b)
        } else if db < 0.0 {
            (*a, a.lerp(*b, da / (da - db)))
        } else {
            (*a, *b)
        };

        let (sa, sb) = (self.to_screen(&a), self.to_screen(&b));
        let (dx, dy) = (sb.x - sa.x, sb.y - sa.y);
        let Some((t0, t1)) = self.clip_segment(sa.x, sa.y, dx, dy) else {
            return;
        };

        let steps = ((dx.abs().max(dy.abs())) * (t1 - t0)).ceil() as usize;
        let mut last = None;
        for i in 0..steps {
            let t = t0 + (t1 - t0) * i as f64 / steps as f64;
            let (x, y) = (
                (sa.x + dx * t).floor() as i64,
                (sa.y + dy * t).floor() as i64,
            );
            if last == Some((x, y)) || !self.in_bounds(x, y) {
                continue;
            }
            last = Some((x, y));

            let tf = t as f32;
            let z = sa.z + (sb.z - sa.z) * tf;
            let inv_w = sa.inv_w + (sb.inv_w - sa.inv_w) * tf;
            let position = sa.view_over_w.lerp(sb.view_over_w, tf) / inv_w;
            if let Some(depth) = fragment_depth(z) {
                emit(RasterFragment {
                    x: x as u32,
                    y: y as u32,
                    depth,
                    position,
                });
            }
        }
    }

    /// Liang-Barsky clip of `p + t * d` against the scissor rectangle.
    fn clip_segment(&self, px: f64, py: f64, dx: f64, dy: f64) -> Option<(f64, f64)> {
        let (x0, y0, x1, y1) = self.bounds;
        let (mut t0, mut t1) = (0.0f64, 1.0f64);
        for (p, q) in [
            (-dx, px - x0 as f64),
            (dx, x1 as f64 - px),
            (-dy, py - y0 as f64),
            (dy, y1 as f64 - py),
        ] {
            if p == 0.0 {
                if q < 0.0 {
                    return None;
                }
            } else {
                let r = q / p;
                if p < 0.0 {
                    t0 = t0.max(r);
                } else {
                    t1 = t1.min(r);
                }
            }
        }
        (t0 < t1).then_some((t0, t1))
    }

    pub fn triangle(&self, v: [ClipVertex; 3], emit: &mut impl FnMut(RasterFragment)) {
        let (poly, n) = clip_near(&v);
        for i in 1..n.saturating_sub(1) {
            self.fill(&poly[0], &poly[i], &poly[i + 1], emit);
        }
    }

    fn fill(
        &self,
        a: &ClipVertex,
        b: &ClipVertex,
        c: &ClipVertex,
        emit: &mut impl FnMut(RasterFragment),
    ) {
        let mut s = [self.to_screen(a), self.to_screen(b), self.to_screen(c)];
        let mut p = s.map(|v| (snap(v.x), snap(v.y)));
        let mut area = orient(p[0], p[1], p[2]);
        if area == 0 {
            return;
        }

        // Screen y points down, so counter-clockwise in NDC has negative area.
        let front_facing = area < 0;
        match self.cull {
            CullMode::Front if front_facing => return,
            CullMode::Back if !front_facing => return,
            _ => {}
        }
        if area < 0 {
            s.swap(1, 2);
            p.swap(1, 2);
            area = -area;
        }

        let (bx0, by0, bx1, by1) = self.bounds;
        let min_x = p.iter().map(|q| q.0).min().unwrap_or(0).div_euclid(SUBPIXEL as i64);
        let max_x = p.iter().map(|q| q.0).max().unwrap_or(0).div_euclid(SUBPIXEL as i64);
        let min_y = p.iter().map(|q| q.1).min().unwrap_or(0).div_euclid(SUBPIXEL as i64);
        let max_y = p.iter().map(|q| q.1).max().unwrap_or(0).div_euclid(SUBPIXEL as i64);
        let x0 = min_x.max(bx0 as i64);
        let x1 = (max_x + 1).min(bx1 as i64);
        let y0 = min_y.max(by0 as i64);
        let y1 = (max_y + 1).min(by1 as i64);

        let area = area as f32;
        for y in y0..y1 {
            for x in x0..x1 {
                let q = (
                    x * SUBPIXEL as i64 + HALF_PIXEL,
                    y * SUBPIXEL as i64 + HALF_PIXEL,
                );
                let w0 = orient(p[1], p[2], q);
                let w1 = orient(p[2], p[0], q);
                let w2 = orient(p[0], p[1], q);
                if !(covers(w0, p[1], p[2]) && covers(w1, p[2], p[0]) && covers(w2, p[0], p[1])) {
                    continue;
                }

                let (l0, l1, l2) = (w0 as f32 / area, w1 as f32 / area, w2 as f32 / area);
                let Some(depth) = fragment_depth(l0 * s[0].z + l1 * s[1].z + l2 * s[2].z) else {
                    continue;
                };
                let inv_w = l0 * s[0].inv_w + l1 * s[1].inv_w + l2 * s[2].inv_w;
                let position = (s[0].view_over_w * l0
                    + s[1].view_over_w * l1
                    + s[2].view_over_w * l2)
                    / inv_w;

                emit(RasterFragment {
                    x: x as u32,
                    y: y as u32,
                    depth,
                    position,
                });
            }
        }
    }
}

/// Clips a triangle against `z >= 0`, giving a polygon of up to 4 vertices.
fn clip_near(tri: &[ClipVertex; 3]) -> ([ClipVertex; 4], usize) {
    let mut out = [tri[0]; 4];
    let mut n = 0;
    for i in 0..3 {
        let a = tri[i];
        let b = tri[(i + 1) % 3];
        let (da, db) = (a.clip.z, b.clip.z);
        if da >= 0.0 {
            out[n] = a;
            n += 1;
        }
        if (da >= 0.0) != (db >= 0.0) {
            out[n] = a.lerp(b, da / (da - db));
            n += 1;
        }
    }
    (out, n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Mat4;

    fn ortho_vertex(x: f32, y: f32, z: f32) -> ClipVertex {
        let view = Vec3::new(x, y, z);
        let proj = Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, 0.1, 10.0);
        ClipVertex {
            clip: proj * view.extend(1.0),
            view,
        }
    }

    fn collect(raster: &Rasterizer, tris: &[[ClipVertex; 3]]) -> Vec<RasterFragment> {
        let mut out = Vec::new();
        for tri in tris {
            raster.triangle(*tri, &mut |f| out.push(f));
        }
        out
    }

    #[test]
    fn shared_diagonal_is_covered_once() {
        let raster = Rasterizer::new(Viewport::full(16, 16), 16, 16, CullMode::None);
        let (a, b, c, d) = (
            ortho_vertex(-1.0, -1.0, -5.0),
            ortho_vertex(1.0, -1.0, -5.0),
            ortho_vertex(1.0, 1.0, -5.0),
            ortho_vertex(-1.0, 1.0, -5.0),
        );
        let fragments = collect(&raster, &[[a, b, c], [c, d, a]]);

        let mut hits = [0u32; 256];
        for f in &fragments {
            hits[(f.y * 16 + f.x) as usize] += 1;
        }
        assert!(hits.iter().all(|&h| h == 1));
    }

    #[test]
    fn depth_is_interpolated_across_a_slanted_triangle() {
        let raster = Rasterizer::new(Viewport::full(8, 8), 8, 8, CullMode::None);
        let tri = [
            ortho_vertex(-1.0, -1.0, -1.0),
            ortho_vertex(1.0, -1.0, -9.0),
            ortho_vertex(-1.0, 1.0, -1.0),
        ];
        let fragments = collect(&raster, &[tri]);
        assert!(!fragments.is_empty());

        let left = fragments.iter().find(|f| f.x == 0).map(|f| f.depth);
        let right = fragments.iter().filter(|f| f.y == 7).map(|f| f.depth).fold(0.0, f32::max);
        assert!(left.is_some_and(|d| d < right));
        for f in &fragments {
            assert!((0.0..=1.0).contains(&f.depth));
            assert!(f.position.z <= -1.0 && f.position.z >= -9.0);
        }
    }

    #[test]
    fn back_face_culling_uses_ndc_winding() {
        let ccw = [
            ortho_vertex(-1.0, -1.0, -5.0),
            ortho_vertex(1.0, -1.0, -5.0),
            ortho_vertex(1.0, 1.0, -5.0),
        ];
        let cw = [ccw[0], ccw[2], ccw[1]];

        let back = Rasterizer::new(Viewport::full(8, 8), 8, 8, CullMode::Back);
        assert!(!collect(&back, &[ccw]).is_empty());
        assert!(collect(&back, &[cw]).is_empty());

        let front = Rasterizer::new(Viewport::full(8, 8), 8, 8, CullMode::Front);
        assert!(collect(&front, &[ccw]).is_empty());
    }

    #[test]
    fn near_plane_clips_geometry_behind_the_camera() {
        let proj = Mat4::perspective_rh(1.0, 1.0, 1.0, 10.0);
        let v = |x: f32, y: f32, z: f32| {
            let view = Vec3::new(x, y, z);
            ClipVertex {
                clip: proj * view.extend(1.0),
                view,
            }
        };
        let raster = Rasterizer::new(Viewport::full(32, 32), 32, 32, CullMode::None);
        let fragments = collect(&raster, &[[v(-1.0, -1.0, -3.0), v(1.0, -1.0, -3.0), v(0.0, 1.0, 2.0)]]);

        assert!(!fragments.is_empty());
        assert!(fragments.iter().all(|f| f.position.z <= -0.999));
    }

    #[test]
    fn line_strip_joint_is_not_repeated() {
        let raster = Rasterizer::new(Viewport::full(8, 8), 8, 8, CullMode::None);
        let (a, b, c) = (
            ortho_vertex(-1.0, 0.1, -5.0),
            ortho_vertex(0.0, 0.1, -5.0),
            ortho_vertex(0.9, 0.1, -5.0),
        );
        let mut xs = Vec::new();
        raster.line(&a, &b, &mut |f| xs.push(f.x));
        raster.line(&b, &c, &mut |f| xs.push(f.x));
        let mut dedup = xs.clone();
        dedup.dedup();
        assert_eq!(xs, dedup);
        assert_eq!(xs.first(), Some(&0));
    }

    #[test]
    fn point_outside_viewport_is_discarded() {
        let raster = Rasterizer::new(Viewport::new(0, 0, 4, 4), 8, 8, CullMode::None);
        let mut count = 0;
        raster.point(&ortho_vertex(0.0, 0.0, -5.0), &mut |_| count += 1);
        raster.point(&ortho_vertex(0.0, 0.0, 5.0), &mut |_| count += 1);
        assert_eq!(count, 1);
    }
}
