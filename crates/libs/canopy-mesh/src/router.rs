//! Package handler registry, route lookup, and mesh-wide counters.
//!
//! Handlers are observers: every registered handler for a tag runs in
//! registration order and none of them consumes the package. Routing
//! decisions are made afterwards from the envelope alone.

use std::collections::BTreeMap;

use canopy_proto::{NodeId, Package};

use crate::connection::{Connection, ConnectionId};

/// `(package, inbound connection, node time at receive) -> handled`.
/// The return value is informational only; it never short-circuits.
pub type PackageHandler = Box<dyn FnMut(&Package, ConnectionId, u32) -> bool + Send>;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<u8, Vec<PackageHandler>>,
}

impl HandlerRegistry {
    pub fn register(&mut self, tag: u8, handler: PackageHandler) {
        self.handlers.entry(tag).or_default().push(handler);
    }

    /// Run every handler registered for the package's tag.
    pub fn dispatch(&mut self, package: &Package, inbound: ConnectionId, node_time: u32) {
        if let Some(handlers) = self.handlers.get_mut(&package.tag()) {
            for handler in handlers {
                handler(package, inbound, node_time);
            }
        }
    }

    pub fn handler_count(&self, tag: u8) -> usize {
        self.handlers.get(&tag).map_or(0, Vec::len)
    }
}

/// The adjacent connection whose advertised subtree contains `dest`.
pub fn find_route<'a, I>(connections: I, dest: NodeId) -> Option<ConnectionId>
where
    I: IntoIterator<Item = &'a Connection>,
{
    connections
        .into_iter()
        .find(|conn| conn.is_established() && conn.subtree.contains(dest))
        .map(|conn| conn.id)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MeshStats {
    pub frames_parsed: u64,
    pub parse_errors: u64,
    pub delivered_local: u64,
    pub forwarded: u64,
    pub broadcasts_relayed: u64,
    pub route_drops: u64,
    pub duplicates_dropped: u64,
    pub node_syncs: u64,
    pub time_syncs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_proto::{BroadcastPackage, SinglePackage};
    use std::sync::{Arc, Mutex};

    #[test]
    fn all_handlers_run_despite_true_returns() {
        let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::default();
        for marker in [1u8, 2, 3] {
            let sink = Arc::clone(&seen);
            registry.register(
                9,
                Box::new(move |_, _, _| {
                    sink.lock().expect("sink").push(marker);
                    true
                }),
            );
        }

        let pkg = Package::Single(SinglePackage { from: 1, dest: 2, msg: "x".into() });
        registry.dispatch(&pkg, 1, 0);
        assert_eq!(*seen.lock().expect("seen"), vec![1, 2, 3]);
    }

    #[test]
    fn dispatch_matches_tag_exactly() {
        let hits: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&hits);
        let mut registry = HandlerRegistry::default();
        registry.register(
            8,
            Box::new(move |_, _, _| {
                *sink.lock().expect("sink") += 1;
                true
            }),
        );

        let single = Package::Single(SinglePackage { from: 1, dest: 2, msg: "x".into() });
        registry.dispatch(&single, 1, 0);
        assert_eq!(*hits.lock().expect("hits"), 0);

        let broadcast = Package::Broadcast(BroadcastPackage { from: 1, msg: "x".into() });
        registry.dispatch(&broadcast, 1, 0);
        assert_eq!(*hits.lock().expect("hits"), 1);
    }
}
