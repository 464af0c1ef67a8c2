//! Known-bridge table and primary-gateway election.
//!
//! Bridge-capable nodes broadcast their status every heartbeat; every node
//! keeps a bounded table of the bridges it has heard from and elects the
//! best one for Internet-bound routing. A node cut off from the mesh keeps
//! routing through the last known good bridge rather than refusing.

use std::collections::BTreeMap;

use canopy_proto::NodeId;

use crate::clock::elapsed_ms;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeInfo {
    pub node_id: NodeId,
    pub internet_connected: bool,
    pub router_rssi: i8,
    pub router_channel: u8,
    /// Local receive time on the wrapping millisecond clock.
    pub last_seen: u32,
    pub uptime_ms: u32,
    pub gateway_ip: String,
    /// Sender's node-time when the status was emitted.
    pub timestamp: u32,
}

impl BridgeInfo {
    pub fn is_healthy(&self, now: u32, timeout_ms: u32) -> bool {
        elapsed_ms(now, self.last_seen) < timeout_ms
    }
}

/// Result of folding one observation into the table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BridgeUpdate {
    /// Set when a bridge was learned or its internet flag flipped.
    pub status_changed: Option<(NodeId, bool)>,
    /// Set when the elected primary changed, either side possibly 0.
    pub primary_changed: Option<(NodeId, NodeId)>,
}

pub struct BridgeTracker {
    bridges: BTreeMap<NodeId, BridgeInfo>,
    capacity: usize,
    timeout_ms: u32,
    primary: NodeId,
}

impl BridgeTracker {
    pub fn new(capacity: usize, timeout_ms: u32) -> Self {
        Self { bridges: BTreeMap::new(), capacity, timeout_ms, primary: 0 }
    }

    /// Fold in a received bridge status. `connected_mode` reflects whether
    /// this node currently has any live mesh connection.
    pub fn observe(&mut self, info: BridgeInfo, connected_mode: bool, now: u32) -> BridgeUpdate {
        let mut update = BridgeUpdate::default();
        let node_id = info.node_id;

        match self.bridges.get_mut(&node_id) {
            Some(existing) => {
                if existing.internet_connected != info.internet_connected {
                    update.status_changed = Some((node_id, info.internet_connected));
                }
                *existing = info;
            }
            None => {
                if self.bridges.len() >= self.capacity {
                    self.purge_expired(now);
                }
                if self.bridges.len() >= self.capacity {
                    self.evict_worst_rssi();
                }
                update.status_changed = Some((node_id, info.internet_connected));
                log::debug!(
                    "bridge: learned {} rssi={} internet={}",
                    node_id,
                    info.router_rssi,
                    info.internet_connected
                );
                self.bridges.insert(node_id, info);
            }
        }

        update.primary_changed = self.reelect(connected_mode, now);
        update
    }

    /// Periodic purge of unhealthy entries, followed by re-election.
    pub fn cleanup(&mut self, connected_mode: bool, now: u32) -> BridgeUpdate {
        let before = self.bridges.len();
        self.purge_expired(now);
        if self.bridges.len() != before {
            log::debug!("bridge: purged {} stale entr(ies)", before - self.bridges.len());
        }
        BridgeUpdate { status_changed: None, primary_changed: self.reelect(connected_mode, now) }
    }

    pub fn primary(&self) -> NodeId {
        self.primary
    }

    pub fn get(&self, node_id: NodeId) -> Option<&BridgeInfo> {
        self.bridges.get(&node_id)
    }

    pub fn gateways(&self) -> Vec<BridgeInfo> {
        self.bridges.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.bridges.len()
    }

    /// Re-run the election and report a transition if the primary moved.
    pub fn reelect(&mut self, connected_mode: bool, now: u32) -> Option<(NodeId, NodeId)> {
        let new = self.elect(connected_mode, now);
        if new != self.primary {
            let old = self.primary;
            self.primary = new;
            log::info!("gw: primary gateway {} -> {}", old, new);
            return Some((old, new));
        }
        None
    }

    fn elect(&self, connected_mode: bool, now: u32) -> NodeId {
        let mut best: Option<&BridgeInfo> = None;
        for info in self.bridges.values() {
            if !info.internet_connected {
                continue;
            }
            // An isolated node cannot receive updates; ignore staleness and
            // keep the last known good bridge.
            if connected_mode && !info.is_healthy(now, self.timeout_ms) {
                continue;
            }
            match best {
                Some(current) if info.router_rssi <= current.router_rssi => {}
                _ => best = Some(info),
            }
        }
        best.map_or(0, |info| info.node_id)
    }

    fn purge_expired(&mut self, now: u32) {
        let timeout = self.timeout_ms;
        self.bridges.retain(|_, info| info.is_healthy(now, timeout));
    }

    fn evict_worst_rssi(&mut self) {
        let victim = self
            .bridges
            .values()
            .min_by_key(|info| info.router_rssi)
            .map(|info| info.node_id);
        if let Some(node_id) = victim {
            log::debug!("bridge: table full, evicting {} (worst RSSI)", node_id);
            self.bridges.remove(&node_id);
        }
    }
}
