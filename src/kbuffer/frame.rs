use std::ops::{Add, AddAssign};

/// Where the K-Buffer is within the current frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FramePhase {
    #[default]
    Idle,
    Cleared,
    /// Number of draws accepted since the clear.
    Stored(u32),
    Resolved,
}

impl FramePhase {
    pub(crate) fn after_draw(self) -> Self {
        match self {
            FramePhase::Cleared => FramePhase::Stored(1),
            FramePhase::Stored(n) => FramePhase::Stored(n + 1),
            FramePhase::Idle | FramePhase::Resolved => {
                log::warn!(
                    "Drawing into the K-Buffer without a clear pass; stale fragments will be resolved."
                );
                FramePhase::Stored(1)
            }
        }
    }
}

/// Fragment counters for one frame, reset by the clear pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub draws: u32,
    pub skipped_draws: u32,
    pub fragments_stored: u64,
    /// Fragments lost to overflow: dropped outright or evicted by a nearer one.
    pub fragments_dropped: u64,
    /// Fragments rejected by the depth test.
    pub fragments_occluded: u64,
}

impl Add for FrameStats {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            draws: self.draws + rhs.draws,
            skipped_draws: self.skipped_draws + rhs.skipped_draws,
            fragments_stored: self.fragments_stored + rhs.fragments_stored,
            fragments_dropped: self.fragments_dropped + rhs.fragments_dropped,
            fragments_occluded: self.fragments_occluded + rhs.fragments_occluded,
        }
    }
}

impl AddAssign for FrameStats {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}
