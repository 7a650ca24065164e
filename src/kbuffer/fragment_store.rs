//! Per-pixel fragment slots written concurrently by the store pass.
//!
//! Every channel is a flat array of atomics laid out slot-major: slot `s` of
//! pixel `p` lives at `s * pixel_count + p`, the same shape as one texture
//! array layer per slot. Only the occupancy counter (and, with
//! [`OverflowPolicy::KeepNearest`], the pixel semaphore) serializes writers;
//! the slot payload is written with relaxed stores into a slot that the
//! writer owns exclusively after claiming it.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use glam::Vec3;
use rayon::prelude::*;

use crate::config::{MAX_K, OverflowPolicy, clamp_k};

/// Depth written by [`FragmentStore::clear`]: the far plane.
pub const FAR_DEPTH: f32 = 1.0;

/// One captured fragment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FragmentRecord {
    pub material: u32,
    /// Normalized device depth in `[0, 1]`.
    pub depth: f32,
    /// View-space position, used for translucent thickness.
    pub position: Vec3,
}

impl Default for FragmentRecord {
    fn default() -> Self {
        Self {
            material: 0,
            depth: FAR_DEPTH,
            position: Vec3::ZERO,
        }
    }
}

/// Fixed-size scratch buffer big enough for any pixel.
pub type FragmentArray = [FragmentRecord; MAX_K as usize];

pub struct FragmentStore {
    width: u32,
    height: u32,
    k: u32,
    policy: OverflowPolicy,
    counts: Vec<AtomicU32>,
    semaphores: Vec<AtomicU32>,
    materials: Vec<AtomicU32>,
    depths: Vec<AtomicU32>,
    positions: Vec<AtomicU32>,
    dropped: AtomicU64,
}

fn atomic_channel(len: usize, value: u32) -> Vec<AtomicU32> {
    (0..len).map(|_| AtomicU32::new(value)).collect()
}

impl FragmentStore {
    pub fn new(width: u32, height: u32, k: u32) -> Self {
        let k = clamp_k(k);
        let pixels = width as usize * height as usize;
        let slots = pixels * k as usize;
        Self {
            width,
            height,
            k,
            policy: OverflowPolicy::default(),
            counts: atomic_channel(pixels, 0),
            semaphores: atomic_channel(pixels, 0),
            materials: atomic_channel(slots, 0),
            depths: atomic_channel(slots, FAR_DEPTH.to_bits()),
            positions: atomic_channel(slots * 3, 0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    pub fn pixel_count(&self) -> usize {
        self.counts.len()
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn set_overflow_policy(&mut self, policy: OverflowPolicy) {
        self.policy = policy;
    }

    /// Linear pixel index, or `None` outside the store.
    pub fn pixel_index(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.width && y < self.height).then(|| y as usize * self.width as usize + x as usize)
    }

    fn slot_index(&self, pixel: usize, slot: u32) -> usize {
        slot as usize * self.pixel_count() + pixel
    }

    /// Resets occupancy and semaphores to 0 and every depth slot to the far
    /// plane. Material and position slots are left as they are; they are
    /// only read below the occupancy count.
    pub fn clear(&self) {
        self.counts
            .par_iter()
            .chain(self.semaphores.par_iter())
            .for_each(|c| c.store(0, Ordering::Relaxed));
        let far = FAR_DEPTH.to_bits();
        self.depths
            .par_iter()
            .for_each(|d| d.store(far, Ordering::Relaxed));
        self.dropped.store(0, Ordering::Relaxed);
    }

    /// Reallocates for a new size or K. Returns `false` when nothing changed.
    ///
    /// A K-only change keeps the per-pixel channels and rebuilds the slot
    /// channels. Any reallocation leaves the store cleared.
    pub fn resize(&mut self, width: u32, height: u32, k: u32) -> bool {
        let k = clamp_k(k);
        if (width, height, k) == (self.width, self.height, self.k) {
            return false;
        }

        if (width, height) == (self.width, self.height) {
            let slots = self.pixel_count() * k as usize;
            self.k = k;
            self.materials = atomic_channel(slots, 0);
            self.depths = atomic_channel(slots, FAR_DEPTH.to_bits());
            self.positions = atomic_channel(slots * 3, 0);
            self.clear();
            log::debug!("fragment store K changed to {}", k);
        } else {
            let policy = self.policy;
            *self = Self::new(width, height, k);
            self.policy = policy;
            log::debug!("fragment store reallocated at {}x{} K={}", width, height, k);
        }
        true
    }

    /// Attempts to store a fragment at `pixel`.
    ///
    /// Returns `false` when the fragment was dropped because the pixel
    /// already holds K fragments (and, under `KeepNearest`, all of them are
    /// nearer). Dropped fragments are counted in [`dropped`](Self::dropped).
    pub fn try_claim_slot(&self, pixel: usize, fragment: &FragmentRecord) -> bool {
        match self.policy {
            OverflowPolicy::DropNewest => self.claim_next(pixel, fragment),
            OverflowPolicy::KeepNearest => self.claim_nearest(pixel, fragment),
        }
    }

    fn claim_next(&self, pixel: usize, fragment: &FragmentRecord) -> bool {
        let k = self.k;
        let claimed = self.counts[pixel].fetch_update(Ordering::AcqRel, Ordering::Relaxed, |c| {
            (c < k).then_some(c + 1)
        });
        match claimed {
            Ok(slot) => {
                self.write_slot(pixel, slot, fragment);
                true
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn claim_nearest(&self, pixel: usize, fragment: &FragmentRecord) -> bool {
        let semaphore = &self.semaphores[pixel];
        while semaphore
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }

        let count = self.counts[pixel].load(Ordering::Relaxed);
        let stored = if count < self.k {
            self.write_slot(pixel, count, fragment);
            self.counts[pixel].store(count + 1, Ordering::Relaxed);
            true
        } else {
            let (far_slot, far_depth) = (0..count)
                .map(|s| (s, self.depth_at(pixel, s)))
                .fold((0, f32::NEG_INFINITY), |acc, cur| if cur.1 > acc.1 { cur } else { acc });
            if fragment.depth < far_depth {
                self.write_slot(pixel, far_slot, fragment);
            }
            self.dropped.fetch_add(1, Ordering::Relaxed);
            fragment.depth < far_depth
        };

        semaphore.store(0, Ordering::Release);
        stored
    }

    fn write_slot(&self, pixel: usize, slot: u32, fragment: &FragmentRecord) {
        let i = self.slot_index(pixel, slot);
        self.materials[i].store(fragment.material, Ordering::Relaxed);
        self.depths[i].store(fragment.depth.to_bits(), Ordering::Relaxed);
        for (c, v) in fragment.position.to_array().into_iter().enumerate() {
            self.positions[i * 3 + c].store(v.to_bits(), Ordering::Relaxed);
        }
    }

    fn depth_at(&self, pixel: usize, slot: u32) -> f32 {
        f32::from_bits(self.depths[self.slot_index(pixel, slot)].load(Ordering::Relaxed))
    }

    /// Number of occupied slots at `pixel`, always `<= k`.
    pub fn occupancy(&self, pixel: usize) -> u32 {
        self.counts[pixel].load(Ordering::Acquire).min(self.k)
    }

    /// Reads slot `slot` of `pixel`, if occupied.
    pub fn fragment(&self, pixel: usize, slot: u32) -> Option<FragmentRecord> {
        if slot >= self.occupancy(pixel) {
            return None;
        }
        let i = self.slot_index(pixel, slot);
        let pos = |c: usize| f32::from_bits(self.positions[i * 3 + c].load(Ordering::Relaxed));
        Some(FragmentRecord {
            material: self.materials[i].load(Ordering::Relaxed),
            depth: f32::from_bits(self.depths[i].load(Ordering::Relaxed)),
            position: Vec3::new(pos(0), pos(1), pos(2)),
        })
    }

    /// Copies the occupied slots of `pixel` into `out`, returning how many.
    pub fn gather(&self, pixel: usize, out: &mut FragmentArray) -> usize {
        let count = self.occupancy(pixel);
        for slot in 0..count {
            if let Some(fragment) = self.fragment(pixel, slot) {
                out[slot as usize] = fragment;
            }
        }
        count as usize
    }

    /// Fragments dropped since the last clear.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Sum of the occupancy of every pixel.
    pub fn total_occupancy(&self) -> u64 {
        (0..self.pixel_count())
            .into_par_iter()
            .map(|p| self.occupancy(p) as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(material: u32, depth: f32) -> FragmentRecord {
        FragmentRecord {
            material,
            depth,
            position: Vec3::new(0.0, 0.0, -depth),
        }
    }

    #[test]
    fn claims_up_to_k_then_drops() {
        let store = FragmentStore::new(2, 2, 3);
        for i in 0..3 {
            assert!(store.try_claim_slot(1, &frag(i, 0.5)));
        }
        assert!(!store.try_claim_slot(1, &frag(9, 0.1)));
        assert_eq!(store.occupancy(1), 3);
        assert_eq!(store.occupancy(0), 0);
        assert_eq!(store.dropped(), 1);
        assert_eq!(store.fragment(1, 2).map(|f| f.material), Some(2));
        assert_eq!(store.fragment(1, 3), None);
    }

    #[test]
    fn concurrent_claims_never_exceed_k() {
        let store = FragmentStore::new(1, 1, 4);
        let successes = (0..1000u32)
            .into_par_iter()
            .filter(|i| store.try_claim_slot(0, &frag(*i, 0.5)))
            .count();
        assert_eq!(successes, 4);
        assert_eq!(store.occupancy(0), 4);
        assert_eq!(store.dropped(), 996);
    }

    #[test]
    fn keep_nearest_retains_closest_fragments() {
        let mut store = FragmentStore::new(1, 1, 2);
        store.set_overflow_policy(OverflowPolicy::KeepNearest);
        for (m, d) in [(0, 0.9), (1, 0.5), (2, 0.1), (3, 0.95)] {
            store.try_claim_slot(0, &frag(m, d));
        }

        let mut out = FragmentArray::default();
        let n = store.gather(0, &mut out);
        let mut kept: Vec<u32> = out[..n].iter().map(|f| f.material).collect();
        kept.sort();
        assert_eq!(kept, vec![1, 2]);
        assert_eq!(store.dropped(), 2);
    }

    #[test]
    fn keep_nearest_under_contention() {
        let mut store = FragmentStore::new(1, 1, 4);
        store.set_overflow_policy(OverflowPolicy::KeepNearest);
        (0..256u32).into_par_iter().for_each(|i| {
            store.try_claim_slot(0, &frag(i, i as f32 / 256.0));
        });

        let mut out = FragmentArray::default();
        let n = store.gather(0, &mut out);
        let mut kept: Vec<u32> = out[..n].iter().map(|f| f.material).collect();
        kept.sort();
        assert_eq!(kept, vec![0, 1, 2, 3]);
    }

    #[test]
    fn clear_resets_counts_and_depths() {
        let store = FragmentStore::new(2, 1, 2);
        store.try_claim_slot(0, &frag(1, 0.25));
        store.clear();
        assert_eq!(store.occupancy(0), 0);
        assert_eq!(store.depth_at(0, 0), FAR_DEPTH);
        assert_eq!(store.dropped(), 0);
    }

    #[test]
    fn resize_same_size_is_noop() {
        let mut store = FragmentStore::new(4, 4, 2);
        store.try_claim_slot(5, &frag(7, 0.3));
        assert!(!store.resize(4, 4, 2));
        assert_eq!(store.fragment(5, 0).map(|f| f.material), Some(7));
    }

    #[test]
    fn resize_k_only_rebuilds_slots() {
        let mut store = FragmentStore::new(4, 4, 2);
        store.try_claim_slot(5, &frag(7, 0.3));
        assert!(store.resize(4, 4, 8));
        assert_eq!(store.k(), 8);
        assert_eq!(store.pixel_count(), 16);
        assert_eq!(store.occupancy(5), 0);
    }

    #[test]
    fn resize_clamps_k() {
        let mut store = FragmentStore::new(1, 1, 0);
        assert_eq!(store.k(), 1);
        store.resize(1, 1, 64);
        assert_eq!(store.k(), MAX_K);
    }
}
