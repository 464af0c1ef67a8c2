//! Deferred transport teardown and the connect-failure blocklist.
//!
//! The transport backend may keep internal references to a handle for
//! hundreds of milliseconds after its last callback, so a closed handle is
//! parked here and dropped only after a cleanup delay. Consecutive
//! deletions are additionally spaced apart so the backend never frees two
//! handles back to back.

use std::collections::BTreeMap;

use canopy_proto::NodeId;

use crate::clock::{deadline, elapsed_ms, is_due};
use crate::transport::Transport;

struct PendingDeletion {
    transport: Box<dyn Transport>,
    due_at: u32,
}

pub struct TeardownQueue {
    pending: Vec<PendingDeletion>,
    last_scheduled: Option<u32>,
    cleanup_delay_ms: u32,
    spacing_ms: u32,
}

impl TeardownQueue {
    pub fn new(cleanup_delay_ms: u32, spacing_ms: u32) -> Self {
        Self { pending: Vec::new(), last_scheduled: None, cleanup_delay_ms, spacing_ms }
    }

    /// Close the handle and park it for deferred deletion. Returns the
    /// scheduled deletion time, pushed out past the previous deletion by at
    /// least the spacing interval.
    pub fn schedule(&mut self, mut transport: Box<dyn Transport>, now: u32) -> u32 {
        transport.close();
        if !transport.freeable() {
            transport.abort();
        }

        let mut due_at = deadline(now, self.cleanup_delay_ms);
        if let Some(last) = self.last_scheduled {
            let min_due = deadline(last, self.spacing_ms);
            if !is_due(due_at, min_due) {
                due_at = min_due;
            }
        }
        self.last_scheduled = Some(due_at);
        self.pending.push(PendingDeletion { transport, due_at });
        log::trace!("teardown: transport deletion scheduled in {}ms", elapsed_ms(due_at, now));
        due_at
    }

    /// Drop every handle whose deletion time has passed. Handles the
    /// backend still holds are pushed out by one spacing interval.
    pub fn run(&mut self, now: u32) -> usize {
        let mut freed = 0;
        let spacing = self.spacing_ms;
        self.pending.retain_mut(|entry| {
            if !is_due(now, entry.due_at) {
                return true;
            }
            if !entry.transport.freeable() {
                entry.due_at = deadline(now, spacing);
                return true;
            }
            freed += 1;
            false
        });
        if freed > 0 {
            log::trace!("teardown: freed {freed} transport handle(s)");
        }
        freed
    }

    /// Synchronous drain for program teardown, when no further scheduler
    /// passes will run.
    pub fn drain_now(&mut self) -> usize {
        let count = self.pending.len();
        if count > 0 {
            log::warn!("teardown: dropping {count} transport handle(s) synchronously");
        }
        self.pending.clear();
        self.last_scheduled = None;
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn scheduled_times(&self) -> Vec<u32> {
        self.pending.iter().map(|entry| entry.due_at).collect()
    }
}

/// Peers that exhausted their connect retries, blocked for a fixed window.
#[derive(Debug, Default)]
pub struct FailureBlocklist {
    entries: BTreeMap<NodeId, u32>,
    duration_ms: u32,
}

impl FailureBlocklist {
    pub fn new(duration_ms: u32) -> Self {
        Self { entries: BTreeMap::new(), duration_ms }
    }

    pub fn block(&mut self, node_id: NodeId, now: u32) {
        if node_id == 0 {
            return;
        }
        log::debug!("blocklist: node {node_id} blocked for {}ms", self.duration_ms);
        self.entries.insert(node_id, now);
    }

    pub fn is_blocked(&self, node_id: NodeId, now: u32) -> bool {
        self.entries
            .get(&node_id)
            .is_some_and(|&blocked_at| elapsed_ms(now, blocked_at) < self.duration_ms)
    }

    pub fn prune(&mut self, now: u32) {
        let duration = self.duration_ms;
        self.entries.retain(|_, &mut blocked_at| elapsed_ms(now, blocked_at) < duration);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
