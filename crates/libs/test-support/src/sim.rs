//! Multi-node mesh simulator: several `MeshCore`s wired together with
//! in-memory links, all driven off one manual clock.

use canopy_mesh::{MeshConfig, MeshCore, NodeId};
use canopy_proto::meship;

use crate::clock::ManualClock;
use crate::transport::{linked_pair, LinkHandle, QueueConnector};

pub struct MeshSim {
    pub clock: ManualClock,
    ids: Vec<NodeId>,
    nodes: Vec<MeshCore>,
    connectors: Vec<QueueConnector>,
}

impl MeshSim {
    pub fn new(ids: &[NodeId]) -> Self {
        Self::with_config(ids, MeshConfig::default())
    }

    pub fn with_config(ids: &[NodeId], config: MeshConfig) -> Self {
        let clock = ManualClock::new();
        // Keep t=0 out of the wrapping-deadline math's trivial corner.
        clock.set_ms(1);
        let mut nodes = Vec::new();
        let mut connectors = Vec::new();
        for &id in ids {
            let connector = QueueConnector::new();
            let mut node = MeshCore::new(config.clone())
                .with_clock(Box::new(clock.clone()))
                .with_transport_factory(Box::new(connector.clone()));
            node.init(id);
            nodes.push(node);
            connectors.push(connector);
        }
        Self { clock, ids: ids.to_vec(), nodes, connectors }
    }

    pub fn node(&mut self, id: NodeId) -> &mut MeshCore {
        let idx = self.index_of(id);
        &mut self.nodes[idx]
    }

    pub fn node_ref(&self, id: NodeId) -> &MeshCore {
        &self.nodes[self.index_of(id)]
    }

    /// Wire `station` out to `ap` with an in-memory duplex link.
    pub fn link(&mut self, station: NodeId, ap: NodeId) {
        let _ = self.link_with_handles(station, ap);
    }

    /// Like `link`, but hands back the endpoint controls so a test can
    /// inject raw events or sever the link. First handle is the station
    /// end, second the AP end.
    pub fn link_with_handles(&mut self, station: NodeId, ap: NodeId) -> (LinkHandle, LinkHandle) {
        let (station_end, ap_end, station_handle, ap_handle) = linked_pair();
        let station_idx = self.index_of(station);
        let ap_idx = self.index_of(ap);
        self.connectors[station_idx].stage(Box::new(station_end));
        self.nodes[station_idx]
            .connect_to(meship::ap_ip_for(ap))
            .expect("sim link connect");
        self.nodes[ap_idx].accept_connection(Box::new(ap_end));
        (station_handle, ap_handle)
    }

    /// One update pass on every node.
    pub fn step(&mut self) {
        for node in &mut self.nodes {
            node.update();
        }
    }

    /// Let in-flight frames drain without moving the clock.
    pub fn settle(&mut self, passes: usize) {
        for _ in 0..passes {
            self.step();
        }
    }

    /// Advance virtual time in increments, updating every node per step.
    pub fn run_ms(&mut self, total_ms: u64, step_ms: u64) {
        let mut remaining = total_ms;
        while remaining > 0 {
            let step = step_ms.min(remaining);
            self.clock.advance_ms(step);
            // A couple of passes per step so multi-hop frames keep moving.
            self.settle(3);
            remaining -= step;
        }
    }

    fn index_of(&self, id: NodeId) -> usize {
        self.ids
            .iter()
            .position(|&known| known == id)
            .unwrap_or_else(|| panic!("unknown sim node {id}"))
    }
}
