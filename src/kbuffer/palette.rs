//! Material table indexed by the compact material index stored per fragment.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::color::Color;

/// Resolve-time parameters of one store-pass material.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaterialEntry {
    pub base_color: Color,
    pub is_translucent: bool,
    pub translucent_color: Color,
    /// Thickness at which a translucent volume reaches `translucent_color`.
    pub max_translucent_thickness: f32,
}

impl Default for MaterialEntry {
    fn default() -> Self {
        Self {
            base_color: Color::WHITE,
            is_translucent: false,
            translucent_color: Color::WHITE,
            max_translucent_thickness: 0.0,
        }
    }
}

impl MaterialEntry {
    pub fn opaque(color: Color) -> Self {
        Self {
            base_color: color.with_alpha(1.0),
            ..Default::default()
        }
    }

    /// Alpha of `color` is its coverage.
    pub fn transparent(color: Color) -> Self {
        Self {
            base_color: color,
            ..Default::default()
        }
    }

    pub fn translucent(base: Color, translucent: Color, max_thickness: f32) -> Self {
        Self {
            base_color: base,
            is_translucent: true,
            translucent_color: translucent,
            max_translucent_thickness: max_thickness.max(0.0),
        }
    }

    /// Fully covers whatever lies behind it. Opaque fragments write the
    /// depth attachment during the store pass.
    pub fn is_opaque(&self) -> bool {
        !self.is_translucent && self.base_color.a >= 1.0
    }
}

/// Hands out material indices. Indices are never reused; clones share the
/// same counter.
#[derive(Clone, Debug, Default)]
pub struct MaterialRegistry {
    next: Arc<AtomicU32>,
}

impl MaterialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of indices handed out so far.
    pub fn count(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }
}

/// Grow-only table of [`MaterialEntry`].
#[derive(Clone, Debug)]
pub struct MaterialPalette {
    entries: Vec<MaterialEntry>,
}

impl MaterialPalette {
    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            entries: vec![MaterialEntry::default(); capacity.max(1) as usize],
        }
    }

    pub fn capacity(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Grows the table to `capacity` entries. Shrinking is ignored so
    /// indices already in use stay valid. Returns `true` if it grew.
    pub fn resize(&mut self, capacity: u32) -> bool {
        if capacity as usize <= self.entries.len() {
            return false;
        }
        self.entries
            .resize(capacity as usize, MaterialEntry::default());
        true
    }

    pub fn get(&self, index: u32) -> Option<&MaterialEntry> {
        self.entries.get(index as usize)
    }

    /// Writes `entry` at `index`, growing the table if the index is past
    /// the end. Returns `true` if the table grew.
    pub fn set(&mut self, index: u32, entry: MaterialEntry) -> bool {
        let grew = self.resize(index + 1);
        if grew {
            log::debug!(
                "material palette grown to {} entries for index {}",
                self.entries.len(),
                index
            );
        }
        self.entries[index as usize] = entry;
        grew
    }

    pub fn entries(&self) -> &[MaterialEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_monotonic_and_shared() {
        let registry = MaterialRegistry::new();
        let clone = registry.clone();
        assert_eq!(registry.register(), 0);
        assert_eq!(clone.register(), 1);
        assert_eq!(registry.register(), 2);
        assert_eq!(clone.count(), 3);
    }

    #[test]
    fn palette_never_shrinks() {
        let mut palette = MaterialPalette::with_capacity(4);
        palette.set(3, MaterialEntry::opaque(Color::RED));
        assert!(!palette.resize(2));
        assert_eq!(palette.capacity(), 4);
        assert_eq!(palette.get(3).map(|e| e.base_color), Some(Color::RED));
    }

    #[test]
    fn set_past_end_grows() {
        let mut palette = MaterialPalette::with_capacity(1);
        assert!(palette.set(7, MaterialEntry::opaque(Color::BLUE)));
        assert_eq!(palette.capacity(), 8);
        assert_eq!(palette.get(6), Some(&MaterialEntry::default()));
    }

    #[test]
    fn opacity_classification() {
        assert!(MaterialEntry::opaque(Color::YELLOW).is_opaque());
        assert!(!MaterialEntry::transparent(Color::MAGENTA.with_alpha(0.3)).is_opaque());
        assert!(!MaterialEntry::translucent(Color::BLACK, Color::GREEN, 0.02).is_opaque());
    }
}
