//! Lifecycle events and user callback registry.
//!
//! Internal processing never invokes user code directly: events queue up
//! during the pass and are drained at the end of `update()`, so callbacks
//! observe settled state and cannot re-enter connection internals.

use canopy_proto::{GatewayDataPackage, NodeId};

#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    NewConnection(NodeId),
    DroppedConnection { node: NodeId, station: bool },
    ChangedConnections,
    Receive { from: NodeId, msg: String },
    NodeTimeAdjusted(i32),
    NodeDelayReceived { node: NodeId, delay_us: u32 },
    BridgeStatusChanged { node: NodeId, internet: bool },
    GatewayChanged { old: NodeId, new: NodeId },
    LocalInternetChanged(bool),
    RtcSyncComplete(u64),
    GatewayData(GatewayDataPackage),
}

type Cb<T> = Vec<Box<T>>;

#[derive(Default)]
pub struct Callbacks {
    new_connection: Cb<dyn FnMut(NodeId) + Send>,
    dropped_connection: Cb<dyn FnMut(NodeId, bool) + Send>,
    changed_connections: Cb<dyn FnMut() + Send>,
    receive: Cb<dyn FnMut(NodeId, &str) + Send>,
    node_time_adjusted: Cb<dyn FnMut(i32) + Send>,
    node_delay_received: Cb<dyn FnMut(NodeId, u32) + Send>,
    bridge_status_changed: Cb<dyn FnMut(NodeId, bool) + Send>,
    gateway_changed: Cb<dyn FnMut(NodeId, NodeId) + Send>,
    local_internet_changed: Cb<dyn FnMut(bool) + Send>,
    rtc_sync_complete: Cb<dyn FnMut(u64) + Send>,
    gateway_data: Cb<dyn FnMut(&GatewayDataPackage) + Send>,
}

impl Callbacks {
    pub fn on_new_connection(&mut self, cb: Box<dyn FnMut(NodeId) + Send>) {
        self.new_connection.push(cb);
    }

    pub fn on_dropped_connection(&mut self, cb: Box<dyn FnMut(NodeId, bool) + Send>) {
        self.dropped_connection.push(cb);
    }

    pub fn on_changed_connections(&mut self, cb: Box<dyn FnMut() + Send>) {
        self.changed_connections.push(cb);
    }

    pub fn on_receive(&mut self, cb: Box<dyn FnMut(NodeId, &str) + Send>) {
        self.receive.push(cb);
    }

    pub fn on_node_time_adjusted(&mut self, cb: Box<dyn FnMut(i32) + Send>) {
        self.node_time_adjusted.push(cb);
    }

    pub fn on_node_delay_received(&mut self, cb: Box<dyn FnMut(NodeId, u32) + Send>) {
        self.node_delay_received.push(cb);
    }

    pub fn on_bridge_status_changed(&mut self, cb: Box<dyn FnMut(NodeId, bool) + Send>) {
        self.bridge_status_changed.push(cb);
    }

    pub fn on_gateway_changed(&mut self, cb: Box<dyn FnMut(NodeId, NodeId) + Send>) {
        self.gateway_changed.push(cb);
    }

    pub fn on_local_internet_changed(&mut self, cb: Box<dyn FnMut(bool) + Send>) {
        self.local_internet_changed.push(cb);
    }

    pub fn on_rtc_sync_complete(&mut self, cb: Box<dyn FnMut(u64) + Send>) {
        self.rtc_sync_complete.push(cb);
    }

    pub fn on_gateway_data(&mut self, cb: Box<dyn FnMut(&GatewayDataPackage) + Send>) {
        self.gateway_data.push(cb);
    }

    pub fn fire(&mut self, event: &MeshEvent) {
        match event {
            MeshEvent::NewConnection(node) => {
                for cb in &mut self.new_connection {
                    cb(*node);
                }
            }
            MeshEvent::DroppedConnection { node, station } => {
                for cb in &mut self.dropped_connection {
                    cb(*node, *station);
                }
            }
            MeshEvent::ChangedConnections => {
                for cb in &mut self.changed_connections {
                    cb();
                }
            }
            MeshEvent::Receive { from, msg } => {
                for cb in &mut self.receive {
                    cb(*from, msg);
                }
            }
            MeshEvent::NodeTimeAdjusted(offset) => {
                for cb in &mut self.node_time_adjusted {
                    cb(*offset);
                }
            }
            MeshEvent::NodeDelayReceived { node, delay_us } => {
                for cb in &mut self.node_delay_received {
                    cb(*node, *delay_us);
                }
            }
            MeshEvent::BridgeStatusChanged { node, internet } => {
                for cb in &mut self.bridge_status_changed {
                    cb(*node, *internet);
                }
            }
            MeshEvent::GatewayChanged { old, new } => {
                for cb in &mut self.gateway_changed {
                    cb(*old, *new);
                }
            }
            MeshEvent::LocalInternetChanged(available) => {
                for cb in &mut self.local_internet_changed {
                    cb(*available);
                }
            }
            MeshEvent::RtcSyncComplete(unix_time) => {
                for cb in &mut self.rtc_sync_complete {
                    cb(*unix_time);
                }
            }
            MeshEvent::GatewayData(package) => {
                for cb in &mut self.gateway_data {
                    cb(package);
                }
            }
        }
    }
}
