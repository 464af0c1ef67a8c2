//! Distributed clock: the scalar node time and the three-step offset
//! exchange.
//!
//! Node time is a 32-bit microsecond value shared across the mesh; each
//! node keeps a wrapping offset over its local monotonic clock. The
//! adoption direction is decided from tree geometry plus the time-authority
//! flag: time flows down from the root (or an RTC holder) toward the
//! leaves.

use canopy_proto::Tree;

/// Wrapping offset applied to the local microsecond clock.
#[derive(Debug, Default)]
pub struct NodeTime {
    offset_us: u32,
}

impl NodeTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_time(&self, local_us: u64) -> u32 {
        (local_us as u32).wrapping_add(self.offset_us)
    }

    pub fn adjust(&mut self, delta_us: i32) {
        self.offset_us = self.offset_us.wrapping_add(delta_us as u32);
    }

    pub fn offset(&self) -> u32 {
        self.offset_us
    }
}

/// Clock offset from one completed exchange: `((t1-t0)+(t2-t3))/2`, all
/// differences taken on the wrapping 32-bit node clock.
pub fn compute_offset(t0: u32, t1: u32, t2: u32, t3: u32) -> i32 {
    let there = t1.wrapping_sub(t0) as i32 as i64;
    let back = t2.wrapping_sub(t3) as i32 as i64;
    ((there + back) / 2) as i32
}

/// Round-trip time excluding the responder's processing gap, in
/// microseconds. Used as a latency sample for connection quality.
pub fn round_trip_us(t0: u32, t1: u32, t2: u32, t3: u32) -> u32 {
    t3.wrapping_sub(t0).wrapping_sub(t2.wrapping_sub(t1))
}

/// Whether this node should adopt the peer's clock rather than offer its
/// own: the peer holds time authority we lack, or the peer is (or leads
/// to) the root.
pub fn adopts_from_peer(self_authority: bool, peer_subtree: &Tree) -> bool {
    (peer_subtree.time_authority && !self_authority)
        || peer_subtree.root
        || peer_subtree.contains_root
}

/// Per-connection exchange state: the probe we sent and have not yet seen
/// answered. Unsolicited replies are dropped against this.
#[derive(Debug, Default)]
pub struct TimeSyncSession {
    pending_t0: Option<u32>,
}

impl TimeSyncSession {
    pub fn begin(&mut self, t0: u32) {
        self.pending_t0 = Some(t0);
    }

    /// Accepts the reply iff it answers our outstanding probe.
    pub fn complete(&mut self, t0: u32) -> bool {
        if self.pending_t0 == Some(t0) {
            self.pending_t0 = None;
            true
        } else {
            false
        }
    }

    pub fn in_flight(&self) -> bool {
        self.pending_t0.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_positive_when_peer_ahead() {
        // Peer clock runs 1000us ahead; symmetric 100us path delay.
        let t0 = 5_000;
        let t1 = 6_100; // t0 + delay + 1000
        let t2 = 6_150;
        let t3 = 5_250; // t0 + rtt
        assert_eq!(compute_offset(t0, t1, t2, t3), 1_000);
    }

    #[test]
    fn offset_negative_when_peer_behind() {
        let t0 = 10_000;
        let t1 = 9_100;
        let t2 = 9_150;
        let t3 = 10_250;
        assert_eq!(compute_offset(t0, t1, t2, t3), -1_000);
    }

    #[test]
    fn offset_survives_wrapping_timestamps() {
        let t0 = u32::MAX - 100;
        let t1 = 950; // ahead by 1000 across the wrap, 50us delay
        let t2 = 1_000;
        let t3 = 0; // 100us rtt
        assert_eq!(compute_offset(t0, t1, t2, t3), 1_000);
    }

    #[test]
    fn rtt_excludes_processing_gap() {
        assert_eq!(round_trip_us(1_000, 2_000, 2_400, 3_000), 1_600);
    }

    #[test]
    fn adjust_accumulates_with_wrap() {
        let mut time = NodeTime::new();
        time.adjust(-500);
        time.adjust(200);
        assert_eq!(time.offset(), (-300i32) as u32);
        assert_eq!(time.node_time(1_000), 700);
    }

    #[test]
    fn adoption_follows_authority_and_geometry() {
        let mut peer = Tree::new(7);
        assert!(!adopts_from_peer(false, &peer));

        peer.time_authority = true;
        assert!(adopts_from_peer(false, &peer));
        assert!(!adopts_from_peer(true, &peer));

        peer.time_authority = false;
        peer.contains_root = true;
        assert!(adopts_from_peer(true, &peer));

        peer.contains_root = false;
        peer.root = true;
        assert!(adopts_from_peer(true, &peer));
    }

    #[test]
    fn session_rejects_unsolicited_replies() {
        let mut session = TimeSyncSession::default();
        assert!(!session.complete(42));
        session.begin(42);
        assert!(!session.complete(41));
        assert!(session.complete(42));
        assert!(!session.in_flight());
    }
}
