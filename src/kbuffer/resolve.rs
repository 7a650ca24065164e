//! Per-pixel sort and front-to-back compositing of the stored fragments.

use std::cmp::Ordering;

use glam::Vec3;
use rayon::prelude::*;

use super::fragment_store::{FragmentArray, FragmentRecord, FragmentStore};
use super::palette::{MaterialEntry, MaterialPalette};
use crate::color::Color;

/// Accumulated coverage past which the fragments behind cannot show.
const OPAQUE_COVERAGE: f32 = 0.999;

/// Post-processing applied to composited pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResolveSettings {
    pub background: Color,
    pub tone_mapped: bool,
    pub exposure: f32,
    pub gamma_corrected: bool,
    pub gamma: f32,
}

impl Default for ResolveSettings {
    fn default() -> Self {
        Self {
            background: Color::BLACK,
            tone_mapped: false,
            exposure: 1.0,
            gamma_corrected: false,
            gamma: 2.2,
        }
    }
}

/// Ascending depth; equal depths fall back to the material index so the
/// result does not depend on which fragment claimed its slot first.
pub fn sort_fragments(fragments: &mut [FragmentRecord]) {
    fragments.sort_unstable_by(|a, b| {
        a.depth
            .total_cmp(&b.depth)
            .then_with(|| a.material.cmp(&b.material))
            .then_with(|| compare_positions(a.position, b.position))
    });
}

fn compare_positions(a: Vec3, b: Vec3) -> Ordering {
    a.x.total_cmp(&b.x)
        .then_with(|| a.y.total_cmp(&b.y))
        .then_with(|| a.z.total_cmp(&b.z))
}

/// Color of a translucent material for a volume of the given thickness.
pub fn translucent_color(entry: &MaterialEntry, thickness: f32) -> Color {
    let t = if entry.max_translucent_thickness <= 0.0 {
        1.0
    } else {
        (thickness / entry.max_translucent_thickness).clamp(0.0, 1.0)
    };
    entry.base_color.lerp(entry.translucent_color, t)
}

/// Composites depth-sorted fragments front to back over `background`.
///
/// A translucent fragment is the entry surface of a volume. Its exit is
/// the next fragment of the same material, which is consumed; without one
/// the volume ends at the next fragment of any material, and with nothing
/// behind it the thickness is the material's maximum. The exit search
/// never looks past the first opaque fragment: whether a surface hidden
/// behind it was stored depends on draw order.
pub fn composite(sorted: &[FragmentRecord], palette: &MaterialPalette, background: Color) -> Color {
    let n = sorted.len();
    let mut consumed = 0u32;
    let mut color = Vec3::ZERO;
    let mut alpha = 0.0f32;
    let is_free = |consumed: u32, j: usize| consumed & (1 << j) == 0;
    let entry_of = |f: &FragmentRecord| palette.get(f.material).copied().unwrap_or_default();

    for i in 0..n {
        if !is_free(consumed, i) {
            continue;
        }
        if alpha >= OPAQUE_COVERAGE {
            break;
        }

        let fragment = &sorted[i];
        let entry = entry_of(fragment);
        let source = if entry.is_translucent {
            let occluder = (i + 1..n)
                .find(|&j| entry_of(&sorted[j]).is_opaque())
                .unwrap_or(n);
            let exit = (i + 1..occluder)
                .find(|&j| is_free(consumed, j) && sorted[j].material == fragment.material);
            let thickness = match exit {
                Some(j) => {
                    consumed |= 1 << j;
                    fragment.position.distance(sorted[j].position)
                }
                None => (i + 1..n)
                    .find(|&j| is_free(consumed, j))
                    .map(|j| fragment.position.distance(sorted[j].position))
                    .unwrap_or(entry.max_translucent_thickness),
            };
            translucent_color(&entry, thickness)
        } else {
            entry.base_color
        };

        let a = source.a.clamp(0.0, 1.0);
        color += (1.0 - alpha) * a * Vec3::new(source.r, source.g, source.b);
        alpha += (1.0 - alpha) * a;
    }

    let rest = 1.0 - alpha;
    Color::rgba(
        color.x + rest * background.r,
        color.y + rest * background.g,
        color.z + rest * background.b,
        alpha + rest * background.a,
    )
}

/// Exposure tone mapping `1 - exp(-c * exposure)`, then gamma `c^(1/gamma)`.
pub fn post_process(color: Color, settings: &ResolveSettings) -> Color {
    let mut rgb = Vec3::new(color.r, color.g, color.b);
    if settings.tone_mapped {
        rgb = Vec3::ONE - (-rgb * settings.exposure).exp();
    }
    if settings.gamma_corrected {
        rgb = rgb.max(Vec3::ZERO).powf(1.0 / settings.gamma);
    }
    Color::rgba(rgb.x, rgb.y, rgb.z, color.a)
}

/// Resolves one pixel's fragments. An empty pixel is the background, untouched.
pub fn resolve_pixel(
    fragments: &mut [FragmentRecord],
    palette: &MaterialPalette,
    settings: &ResolveSettings,
) -> Color {
    if fragments.is_empty() {
        return settings.background;
    }
    sort_fragments(fragments);
    post_process(composite(fragments, palette, settings.background), settings)
}

/// Resolves the pixels of `region` (`x0, y0, x1, y1`, end exclusive) of a
/// row-major `pixels` image of the given width. Rows run in parallel.
pub(crate) fn resolve_region(
    store: &FragmentStore,
    palette: &MaterialPalette,
    settings: &ResolveSettings,
    pixels: &mut [Color],
    width: u32,
    region: (u32, u32, u32, u32),
) {
    let (x0, y0, x1, y1) = region;
    if width == 0 {
        return;
    }
    pixels
        .par_chunks_mut(width as usize)
        .enumerate()
        .filter(|(y, _)| (y0 as usize..y1 as usize).contains(y))
        .for_each(|(y, row)| {
            let mut scratch = FragmentArray::default();
            for x in x0..x1 {
                row[x as usize] = match store.pixel_index(x, y as u32) {
                    Some(pixel) => {
                        let n = store.gather(pixel, &mut scratch);
                        resolve_pixel(&mut scratch[..n], palette, settings)
                    }
                    None => settings.background,
                };
            }
        });
}
