//! Deterministic time source shared between simulated nodes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use canopy_mesh::Clock;

/// A clock that only moves when a test advances it. Clones share the same
/// underlying instant, so one handle can drive a whole simulated mesh.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_ms(&self, ms: u64) {
        self.micros.fetch_add(ms * 1_000, Ordering::SeqCst);
    }

    pub fn advance_us(&self, us: u64) {
        self.micros.fetch_add(us, Ordering::SeqCst);
    }

    pub fn set_ms(&self, ms: u64) {
        self.micros.store(ms * 1_000, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn millis(&self) -> u32 {
        (self.micros.load(Ordering::SeqCst) / 1_000) as u32
    }

    fn micros(&self) -> u64 {
        self.micros.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_same_instant() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.advance_ms(1_500);
        assert_eq!(other.millis(), 1_500);
        assert_eq!(other.micros(), 1_500_000);
    }
}
