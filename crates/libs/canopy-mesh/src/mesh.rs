//! The mesh core: owns the connection arena, the scheduler, the protocol
//! tables, and the single public suspension point, `update()`.
//!
//! Everything asynchronous in the mesh is expressed as a task kind
//! dispatched from one cooperative pass: transport polls feed the receive
//! buffers, due timers drive the NodeSync/TimeSync/timeout protocols, send
//! pumps drain the priority buffers, and user callbacks fire last against
//! settled state.

use std::collections::{BTreeMap, VecDeque};

use canopy_proto::{
    meship, BridgeStatusPackage, BroadcastPackage, GatewayAckPackage, GatewayDataPackage, NodeId,
    NodeSyncPackage, Package, Priority, SinglePackage, TimeDelayPackage, TimeSyncPackage,
    TimeSyncStep, Tree,
};

use crate::bridge::{BridgeInfo, BridgeTracker, BridgeUpdate};
use crate::clock::{Clock, SystemClock};
use crate::config::MeshConfig;
use crate::connection::{
    Connection, ConnectionId, ConnectionReport, ConnectionRole, ConnectionState, ConnectionTasks,
};
use crate::error::MeshError;
use crate::events::{Callbacks, MeshEvent};
use crate::gateway::{
    InternetCallback, PendingInternetRequest, PendingTable, ERR_API_DISABLED, ERR_CANCELLED,
    ERR_MAX_RETRIES, ERR_NO_GATEWAY, ERR_TIMED_OUT,
};
use crate::health::{HealthChecker, InternetProbe, InternetStatus};
use crate::queue::{FillLevel, FlushReport, OfflineQueue, QueueStats, QueuedMessage};
use crate::router::{find_route, HandlerRegistry, MeshStats, PackageHandler};
use crate::scheduler::{Iterations, Scheduler, TaskId};
use crate::teardown::{FailureBlocklist, TeardownQueue};
use crate::timesync::{adopts_from_peer, compute_offset, round_trip_us, NodeTime};
use crate::tracker::MessageTracker;
use crate::transport::{NullWifi, Transport, TransportEvent, TransportFactory, WifiDriver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    NodeSync(ConnectionId),
    TimeSync(ConnectionId),
    ConnectionTimeout(ConnectionId),
    ConnectRetry(ConnectionId),
    BridgeHeartbeat,
    BridgeCleanup,
    HealthProbe,
    PendingSweep,
    RequestRetry(u32),
    RequestTimeout(u32),
    WifiReconnect,
}

struct DeferredResult {
    callback: InternetCallback,
    success: bool,
    http_status: u16,
    error: String,
}

pub struct MeshCore {
    node_id: NodeId,
    config: MeshConfig,
    clock: Box<dyn Clock>,
    scheduler: Scheduler<TaskKind>,
    connections: BTreeMap<ConnectionId, Connection>,
    next_connection_id: ConnectionId,
    factory: Option<Box<dyn TransportFactory>>,
    wifi: Box<dyn WifiDriver>,
    teardown: TeardownQueue,
    blocklist: FailureBlocklist,
    tracker: MessageTracker,
    handlers: HandlerRegistry,
    callbacks: Callbacks,
    events: VecDeque<MeshEvent>,
    node_time: NodeTime,
    root: bool,
    time_authority: bool,
    bridge_capable: bool,
    bridges: BridgeTracker,
    pending: PendingTable,
    sweep_task: Option<TaskId>,
    pending_delay: BTreeMap<NodeId, u32>,
    queue: OfflineQueue,
    health: HealthChecker,
    deferred_results: Vec<DeferredResult>,
    stats: MeshStats,
    started: bool,
}

impl MeshCore {
    pub fn new(config: MeshConfig) -> Self {
        let teardown = TeardownQueue::new(
            config.tcp_client_cleanup_delay_ms,
            config.tcp_client_deletion_spacing_ms,
        );
        let blocklist = FailureBlocklist::new(config.tcp_failure_block_duration_ms);
        let tracker =
            MessageTracker::new(config.max_tracked_messages, config.duplicate_tracking_timeout_ms);
        let bridges =
            BridgeTracker::new(config.gateway.max_known_bridges, config.gateway.bridge_timeout_ms);
        let queue = OfflineQueue::new(config.queue.clone());
        let health = HealthChecker::new(config.health.clone());

        Self {
            node_id: 0,
            config,
            clock: Box::new(SystemClock::new()),
            scheduler: Scheduler::new(),
            connections: BTreeMap::new(),
            next_connection_id: 1,
            factory: None,
            wifi: Box::new(NullWifi::default()),
            teardown,
            blocklist,
            tracker,
            handlers: HandlerRegistry::default(),
            callbacks: Callbacks::default(),
            events: VecDeque::new(),
            node_time: NodeTime::new(),
            root: false,
            time_authority: false,
            bridge_capable: false,
            bridges,
            pending: PendingTable::new(),
            sweep_task: None,
            pending_delay: BTreeMap::new(),
            queue,
            health,
            deferred_results: Vec::new(),
            stats: MeshStats::default(),
            started: false,
        }
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_transport_factory(mut self, factory: Box<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_wifi(mut self, wifi: Box<dyn WifiDriver>) -> Self {
        self.wifi = wifi;
        self
    }

    /// Place self at the root of the local tree and start the baseline
    /// maintenance tasks.
    pub fn init(&mut self, node_id: NodeId) {
        let now = self.clock.millis();
        self.node_id = node_id;
        self.started = true;

        if self.config.gateway.cleanup_enabled {
            self.scheduler.schedule_every(
                TaskKind::BridgeCleanup,
                self.config.gateway.bridge_timeout_ms,
                now,
            );
        }
        self.scheduler.schedule_every(TaskKind::HealthProbe, self.health.interval_ms(), now);

        log::info!("mesh({node_id}): initialized");
    }

    /// Full teardown: close every connection, fail outstanding Internet
    /// requests, and drop parked transports synchronously.
    pub fn stop(&mut self) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.close_connection(id, "mesh stopping");
        }
        for request in self.pending.drain() {
            self.defer_result(request.callback, false, 0, ERR_API_DISABLED);
        }
        self.pending.set_enabled(false);
        if let Some(task) = self.sweep_task.take() {
            self.scheduler.remove(task);
        }
        self.teardown.drain_now();
        self.drain_deferred_results();
        self.drain_events();
        self.started = false;
        log::info!("mesh({}): stopped", self.node_id);
    }

    // ---------------------------------------------------------------- update

    /// One cooperative pass: poll transports, deliver frames, run due
    /// tasks, pump sends, sweep teardowns, then fire user callbacks.
    pub fn update(&mut self) -> bool {
        let now = self.clock.millis();
        let now_us = self.clock.micros();
        let mut did_work = false;

        did_work |= self.poll_transports(now);
        if let Some(available) = self.health.poll(now) {
            self.events.push_back(MeshEvent::LocalInternetChanged(available));
        }
        did_work |= self.pump_receive(now, now_us);

        let due = self.scheduler.execute(now);
        did_work |= !due.is_empty();
        for kind in due {
            let now = self.clock.millis();
            let now_us = self.clock.micros();
            self.dispatch_task(kind, now, now_us);
        }

        did_work |= self.pump_send();
        did_work |= self.teardown.run(now) > 0;
        did_work |= self.drain_deferred_results();
        did_work |= self.drain_events();
        did_work
    }

    fn dispatch_task(&mut self, kind: TaskKind, now: u32, now_us: u64) {
        match kind {
            TaskKind::NodeSync(id) => self.run_node_sync(id),
            TaskKind::TimeSync(id) => self.run_time_sync(id, now_us),
            TaskKind::ConnectionTimeout(id) => {
                log::warn!("conn({id}): node sync timeout, closing");
                self.close_connection(id, "node sync timeout");
            }
            TaskKind::ConnectRetry(id) => self.run_connect_retry(id),
            TaskKind::BridgeHeartbeat => self.run_bridge_heartbeat(now, now_us),
            TaskKind::BridgeCleanup => {
                let connected = self.has_live_connections();
                let update = self.bridges.cleanup(connected, now);
                self.push_bridge_events(update);
                self.blocklist.prune(now);
            }
            TaskKind::HealthProbe => {
                if let Some(available) = self.health.start_check(now) {
                    self.events.push_back(MeshEvent::LocalInternetChanged(available));
                }
            }
            TaskKind::PendingSweep => self.run_pending_sweep(now),
            TaskKind::RequestRetry(message_id) => self.run_request_retry(message_id, now, now_us),
            TaskKind::RequestTimeout(message_id) => {
                if self.pending.get_mut(message_id).is_some_and(|req| req.is_expired(now)) {
                    self.fail_request(message_id, ERR_TIMED_OUT);
                }
            }
            TaskKind::WifiReconnect => {
                log::info!("mesh({}): requesting wifi reconnect", self.node_id);
                self.wifi.request_reconnect();
            }
        }
    }

    // ----------------------------------------------------- connection set-up

    /// Open an outbound (station-side) connection toward a peer AP.
    pub fn connect_to(&mut self, ip: [u8; 4]) -> Result<ConnectionId, MeshError> {
        let now = self.clock.millis();
        self.blocklist.prune(now);
        if let Some(node_id) = meship::node_id_from_ip(ip) {
            if self.blocklist.is_blocked(node_id, now) {
                return Err(MeshError::Blocklisted(node_id));
            }
        }
        let factory = self.factory.as_mut().ok_or(MeshError::NoFactory)?;
        let transport = factory.connect(ip, meship::MESH_PORT);
        Ok(self.add_connection(ConnectionRole::Station, transport, Some(ip)))
    }

    /// Adopt an inbound (AP-side) transport accepted by the host listener.
    pub fn accept_connection(&mut self, transport: Box<dyn Transport>) -> ConnectionId {
        self.add_connection(ConnectionRole::Ap, transport, None)
    }

    fn add_connection(
        &mut self,
        role: ConnectionRole,
        transport: Box<dyn Transport>,
        target_ip: Option<[u8; 4]>,
    ) -> ConnectionId {
        let id = self.next_connection_id;
        self.next_connection_id += 1;

        let mut conn =
            Connection::new(id, role, transport, target_ip, self.config.send_queue_max_frames);
        let tasks = ConnectionTasks {
            node_sync: self.scheduler.add(
                TaskKind::NodeSync(id),
                self.config.node_sync_interval_ms,
                Iterations::Forever,
            ),
            time_sync: self.scheduler.add(
                TaskKind::TimeSync(id),
                self.config.time_sync_interval_ms,
                Iterations::Forever,
            ),
            timeout: self.scheduler.add(
                TaskKind::ConnectionTimeout(id),
                self.config.node_timeout_ms,
                Iterations::Forever,
            ),
        };
        conn.tasks = Some(tasks);
        let already_active = conn.is_active();
        self.connections.insert(id, conn);
        log::debug!("conn({id}): created ({role:?})");

        if already_active {
            self.arm_connection_tasks(id);
        }
        id
    }

    fn arm_connection_tasks(&mut self, id: ConnectionId) {
        let now = self.clock.millis();
        let Some(conn) = self.connections.get(&id) else {
            return;
        };
        let Some(tasks) = conn.tasks else {
            return;
        };
        match conn.role {
            // Stations ask first; AP side staggers its first sync so both
            // ends do not collide on a fresh link.
            ConnectionRole::Station => self.scheduler.enable(tasks.node_sync, now),
            ConnectionRole::Ap => {
                self.scheduler.enable_delayed(tasks.node_sync, self.config.node_sync_ap_stagger_ms, now)
            }
        }
        self.scheduler.enable_delayed(tasks.time_sync, self.config.time_sync_initial_delay_ms, now);
        self.scheduler.enable_delayed(tasks.timeout, self.config.node_timeout_ms, now);
    }

    fn close_connection(&mut self, id: ConnectionId, reason: &str) {
        let now = self.clock.millis();
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };
        if let Some(tasks) = conn.tasks {
            self.scheduler.remove(tasks.node_sync);
            self.scheduler.remove(tasks.time_sync);
            self.scheduler.remove(tasks.timeout);
        }
        let dropped = conn.send.clear();
        conn.stats.messages_dropped += dropped as u32;
        conn.recv.clear();
        if let Some(transport) = conn.transport.take() {
            self.teardown.schedule(transport, now);
        }
        log::info!("conn({id}): closed (peer {}, {reason})", conn.peer);
        if conn.peer != 0 {
            self.events.push_back(MeshEvent::DroppedConnection {
                node: conn.peer,
                station: conn.role == ConnectionRole::Station,
            });
            self.events.push_back(MeshEvent::ChangedConnections);
        }
    }

    // -------------------------------------------------------- transport I/O

    fn poll_transports(&mut self, now: u32) -> bool {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        let mut did_work = false;
        for id in ids {
            let events = match self.connections.get_mut(&id) {
                Some(conn) => match conn.transport.as_mut() {
                    Some(transport) => transport.poll(),
                    None => Vec::new(),
                },
                None => Vec::new(),
            };
            for event in events {
                did_work = true;
                self.handle_transport_event(id, event, now);
            }
        }
        did_work
    }

    fn handle_transport_event(&mut self, id: ConnectionId, event: TransportEvent, now: u32) {
        match event {
            TransportEvent::Connected => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.state = ConnectionState::Active;
                    conn.connect_retries = 0;
                    log::info!("conn({id}): transport up");
                }
                self.arm_connection_tasks(id);
            }
            TransportEvent::Data(bytes) => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.recv.push(&bytes);
                }
            }
            TransportEvent::Sent(_) => {}
            TransportEvent::Disconnected => {
                if self.is_connecting(id) {
                    self.handle_connect_failure(id, now);
                } else {
                    self.close_connection(id, "peer disconnected");
                }
            }
            TransportEvent::Error(code) => {
                log::debug!("conn({id}): transport error {code}");
                if self.is_connecting(id) {
                    self.handle_connect_failure(id, now);
                } else {
                    self.close_connection(id, "transport error");
                }
            }
        }
    }

    fn is_connecting(&self, id: ConnectionId) -> bool {
        self.connections
            .get(&id)
            .is_some_and(|conn| conn.state == ConnectionState::Connecting)
    }

    /// Bounded retry with capped exponential backoff; on exhaustion the
    /// target is blocklisted and a Wi-Fi reconnect is requested.
    fn handle_connect_failure(&mut self, id: ConnectionId, now: u32) {
        let (retries, target_ip, transport) = match self.connections.get_mut(&id) {
            Some(conn) => (conn.connect_retries, conn.target_ip, conn.transport.take()),
            None => return,
        };
        if let Some(transport) = transport {
            self.teardown.schedule(transport, now);
        }

        if retries < self.config.tcp_connect_max_retries {
            let factor = (1u32 << retries.min(31)).min(self.config.tcp_retry_backoff_cap);
            let delay = self.config.tcp_connect_retry_delay_ms.saturating_mul(factor);
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.connect_retries = retries + 1;
            }
            log::debug!("conn({id}): connect failed, retry {} in {delay}ms", retries + 1);
            self.scheduler.schedule_once(TaskKind::ConnectRetry(id), delay, now);
            return;
        }

        log::warn!("conn({id}): connect retries exhausted");
        if let Some(node_id) = target_ip.and_then(meship::node_id_from_ip) {
            self.blocklist.block(node_id, now);
        }
        self.close_connection(id, "connect retries exhausted");
        self.scheduler.schedule_once(
            TaskKind::WifiReconnect,
            self.config.tcp_exhaustion_reconnect_delay_ms,
            now,
        );
    }

    fn run_connect_retry(&mut self, id: ConnectionId) {
        let target_ip = match self.connections.get(&id) {
            Some(conn) if conn.state == ConnectionState::Connecting && conn.transport.is_none() => {
                conn.target_ip
            }
            _ => return,
        };
        let (Some(ip), Some(factory)) = (target_ip, self.factory.as_mut()) else {
            return;
        };
        let transport = factory.connect(ip, meship::MESH_PORT);
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.transport = Some(transport);
        }
    }

    // ------------------------------------------------------- receive & route

    /// Deliver at most one completed frame per connection per pass.
    fn pump_receive(&mut self, now: u32, now_us: u64) -> bool {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        let mut did_work = false;
        for id in ids {
            let frame = match self.connections.get_mut(&id) {
                Some(conn) => conn.recv.pop_front(),
                None => None,
            };
            let Some(frame) = frame else {
                continue;
            };
            did_work = true;
            match Package::decode(&frame) {
                Ok(package) => {
                    self.stats.frames_parsed += 1;
                    if let Some(conn) = self.connections.get_mut(&id) {
                        conn.stats.messages_rx += 1;
                    }
                    self.route_package(package, id, now, now_us);
                }
                Err(err) => {
                    self.stats.parse_errors += 1;
                    log::debug!("conn({id}): dropping unparseable frame: {err}");
                }
            }
        }
        did_work
    }

    fn route_package(&mut self, package: Package, inbound: ConnectionId, now: u32, now_us: u64) {
        let node_time = self.node_time.node_time(now_us);
        self.handlers.dispatch(&package, inbound, node_time);

        match &package {
            Package::NodeSyncRequest(p) => {
                self.handle_node_sync(inbound, p.tree.clone(), false, now)
            }
            Package::NodeSyncReply(p) => self.handle_node_sync(inbound, p.tree.clone(), true, now),
            Package::TimeSync(p) if p.dest == self.node_id => {
                self.handle_time_sync(inbound, p.from, p.msg, now_us)
            }
            Package::TimeDelay(p) if p.dest == self.node_id => self.handle_time_delay(p, now_us),
            Package::BridgeStatus(p) => self.handle_bridge_status(p, now),
            Package::GatewayData(p) if p.dest == self.node_id => {
                self.handle_gateway_data(p.clone(), now)
            }
            Package::GatewayAck(p) if p.dest == self.node_id && p.origin == self.node_id => {
                self.handle_gateway_ack(p)
            }
            Package::Single(p) if p.dest == self.node_id => {
                self.stats.delivered_local += 1;
                self.events.push_back(MeshEvent::Receive { from: p.from, msg: p.msg.clone() });
            }
            Package::Broadcast(p) => {
                if p.from != self.node_id {
                    self.stats.delivered_local += 1;
                    self.events.push_back(MeshEvent::Receive { from: p.from, msg: p.msg.clone() });
                }
            }
            _ => {}
        }

        if let Some(dest) = package.dest() {
            if dest != self.node_id && dest != 0 {
                self.forward(&package, dest, inbound);
            }
        } else if package.is_broadcast() {
            let relayed = self.relay(&package, Some(inbound), Priority::Normal);
            self.stats.broadcasts_relayed += relayed as u64;
        }
    }

    fn forward(&mut self, package: &Package, dest: NodeId, inbound: ConnectionId) {
        let priority = match package {
            Package::GatewayData(p) => p.priority,
            Package::GatewayAck(_) | Package::TimeSync(_) => Priority::High,
            _ => Priority::Normal,
        };
        let route = find_route(self.connections.values(), dest);
        match route {
            Some(route) if route != inbound => {
                if self.enqueue_package(route, package, priority) {
                    self.stats.forwarded += 1;
                }
            }
            _ => {
                self.stats.route_drops += 1;
                log::trace!("mesh({}): no route to {dest}, dropping", self.node_id);
            }
        }
    }

    /// Re-send on every established connection except `exclude`; returns
    /// the number of successful enqueues.
    fn relay(&mut self, package: &Package, exclude: Option<ConnectionId>, priority: Priority) -> usize {
        let targets: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|conn| conn.is_established() && Some(conn.id) != exclude)
            .map(|conn| conn.id)
            .collect();
        let mut sent = 0;
        for id in targets {
            if self.enqueue_package(id, package, priority) {
                sent += 1;
            }
        }
        sent
    }

    fn enqueue_package(&mut self, id: ConnectionId, package: &Package, priority: Priority) -> bool {
        let body = package.encode();
        let Some(conn) = self.connections.get_mut(&id) else {
            return false;
        };
        if !conn.is_active() {
            conn.stats.messages_dropped += 1;
            return false;
        }
        if conn.send.push(&body, priority) {
            conn.stats.messages_tx += 1;
            true
        } else {
            conn.stats.messages_dropped += 1;
            log::debug!("conn({id}): send buffer full, dropping frame");
            false
        }
    }

    // -------------------------------------------------------------- NodeSync

    fn run_node_sync(&mut self, id: ConnectionId) {
        if !self.connections.get(&id).is_some_and(Connection::is_active) {
            return;
        }
        let tree = self.build_tree(Some(id));
        let package =
            Package::NodeSyncRequest(NodeSyncPackage { from: self.node_id, tree });
        self.enqueue_package(id, &package, Priority::Normal);
    }

    fn handle_node_sync(&mut self, id: ConnectionId, tree: Tree, is_reply: bool, now: u32) {
        self.stats.node_syncs += 1;
        // A reconnecting peer shows up on a fresh connection while the old
        // one lingers; the newer link supersedes it.
        let stale = self
            .connections
            .iter()
            .find_map(|(&other_id, other)| {
                (other_id != id && other.peer != 0 && other.peer == tree.node_id)
                    .then_some(other_id)
            });

        let mut discovered = None;
        let mut changed = false;
        let mut tasks = None;
        if let Some(conn) = self.connections.get_mut(&id) {
            if conn.peer == 0 && tree.node_id != 0 {
                conn.peer = tree.node_id;
                discovered = Some(tree.node_id);
            }
            if conn.subtree != tree {
                conn.subtree = tree;
                changed = true;
            }
            tasks = conn.tasks;
        }

        if let Some(peer) = discovered {
            log::info!("conn({id}): peer identified as {peer}");
            if let Some(stale_id) = stale {
                self.close_connection(stale_id, "superseded by newer link from peer");
            }
            self.events.push_back(MeshEvent::NewConnection(peer));
        }
        if changed {
            self.events.push_back(MeshEvent::ChangedConnections);
            self.sync_layout(id, now);
        }
        // Every sync proves the link alive; push the silence deadline out.
        if let Some(tasks) = tasks {
            self.scheduler.enable_delayed(tasks.timeout, self.config.node_timeout_ms, now);
        }
        if !is_reply {
            let tree = self.build_tree(Some(id));
            let package = Package::NodeSyncReply(NodeSyncPackage { from: self.node_id, tree });
            self.enqueue_package(id, &package, Priority::Normal);
        }
    }

    /// A neighbour's advertisement changed, so every other neighbour's view
    /// of us is stale: pull their next sync forward instead of waiting out
    /// the full interval.
    fn sync_layout(&mut self, origin: ConnectionId, now: u32) {
        let others: Vec<ConnectionTasks> = self
            .connections
            .values()
            .filter(|conn| conn.id != origin && conn.is_established())
            .filter_map(|conn| conn.tasks)
            .collect();
        for tasks in others {
            self.scheduler.force_next_iteration(tasks.node_sync, now);
        }
    }

    /// The local tree: self at the root, each established neighbour's
    /// advertised subtree as a child, optionally excluding one connection
    /// (the one being advertised to).
    fn build_tree(&self, exclude: Option<ConnectionId>) -> Tree {
        let mut tree = Tree::new(self.node_id);
        tree.root = self.root;
        tree.time_authority = self.time_authority;
        for conn in self.connections.values() {
            if conn.is_established() && Some(conn.id) != exclude {
                tree.subs.push(conn.subtree.clone());
            }
        }
        tree.contains_root =
            tree.root || tree.subs.iter().any(|sub| sub.root || sub.contains_root);
        tree
    }

    // -------------------------------------------------------------- TimeSync

    fn run_time_sync(&mut self, id: ConnectionId, now_us: u64) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if !conn.is_established() {
            return;
        }
        self.stats.time_syncs += 1;
        let peer = conn.peer;
        let msg = if adopts_from_peer(self.time_authority, &conn.subtree) {
            let t0 = self.node_time.node_time(now_us);
            conn.time_sync.begin(t0);
            TimeSyncStep::Probe { t0 }
        } else {
            // We are closer to the time source; ask the peer to pull.
            TimeSyncStep::Request
        };
        let package =
            Package::TimeSync(TimeSyncPackage { from: self.node_id, dest: peer, msg });
        self.enqueue_package(id, &package, Priority::High);
    }

    fn handle_time_sync(&mut self, id: ConnectionId, from: NodeId, msg: TimeSyncStep, now_us: u64) {
        match msg {
            TimeSyncStep::Request => {
                let t0 = self.node_time.node_time(now_us);
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.time_sync.begin(t0);
                }
                let package = Package::TimeSync(TimeSyncPackage {
                    from: self.node_id,
                    dest: from,
                    msg: TimeSyncStep::Probe { t0 },
                });
                self.enqueue_package(id, &package, Priority::High);
            }
            TimeSyncStep::Probe { t0 } => {
                let t1 = self.node_time.node_time(now_us);
                let t2 = self.node_time.node_time(self.clock.micros());
                let package = Package::TimeSync(TimeSyncPackage {
                    from: self.node_id,
                    dest: from,
                    msg: TimeSyncStep::Reply { t0, t1, t2 },
                });
                self.enqueue_package(id, &package, Priority::High);
            }
            TimeSyncStep::Reply { t0, t1, t2 } => {
                let accepted = self
                    .connections
                    .get_mut(&id)
                    .is_some_and(|conn| conn.time_sync.complete(t0));
                if !accepted {
                    log::debug!("conn({id}): unsolicited time sync reply dropped");
                    return;
                }
                let t3 = self.node_time.node_time(now_us);
                let offset = compute_offset(t0, t1, t2, t3);
                self.node_time.adjust(offset);
                log::debug!("mesh({}): node time adjusted by {offset}us", self.node_id);
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.stats.record_latency_ms(round_trip_us(t0, t1, t2, t3) / 1_000);
                }
                self.events.push_back(MeshEvent::NodeTimeAdjusted(offset));
            }
        }
    }

    fn handle_time_delay(&mut self, package: &TimeDelayPackage, now_us: u64) {
        if self.pending_delay.get(&package.from) == Some(&package.time) {
            // Echo of our own probe: one-way estimate is half the round trip.
            self.pending_delay.remove(&package.from);
            let delay_us =
                self.node_time.node_time(now_us).wrapping_sub(package.time) / 2;
            self.events
                .push_back(MeshEvent::NodeDelayReceived { node: package.from, delay_us });
            return;
        }
        // A probe aimed at us: echo it back untouched.
        let echo = Package::TimeDelay(TimeDelayPackage {
            from: self.node_id,
            dest: package.from,
            time: package.time,
        });
        let route = find_route(self.connections.values(), package.from);
        if let Some(route) = route {
            self.enqueue_package(route, &echo, Priority::High);
        }
    }

    /// Route a latency probe to `dest`; the result arrives through
    /// `on_node_delay_received`.
    pub fn start_delay_measurement(&mut self, dest: NodeId) -> bool {
        if dest == self.node_id || dest == 0 {
            return false;
        }
        let t0 = self.node_time.node_time(self.clock.micros());
        let package =
            Package::TimeDelay(TimeDelayPackage { from: self.node_id, dest, time: t0 });
        let route = find_route(self.connections.values(), dest);
        match route {
            Some(route) => {
                self.pending_delay.insert(dest, t0);
                self.enqueue_package(route, &package, Priority::High)
            }
            None => false,
        }
    }

    // ------------------------------------------------------ bridges & gateway

    fn run_bridge_heartbeat(&mut self, now: u32, now_us: u64) {
        if !self.bridge_capable {
            return;
        }
        let gateway_ip = self.wifi.gateway_ip();
        let package = BridgeStatusPackage {
            from: self.node_id,
            internet_connected: self.health.available(),
            router_rssi: self.wifi.rssi(),
            router_channel: self.wifi.channel(),
            uptime_ms: now,
            gateway_ip: format!(
                "{}.{}.{}.{}",
                gateway_ip[0], gateway_ip[1], gateway_ip[2], gateway_ip[3]
            ),
            timestamp: self.node_time.node_time(now_us),
        };
        // Track our own status so a gateway knows when it is primary.
        let info = BridgeInfo {
            node_id: self.node_id,
            internet_connected: package.internet_connected,
            router_rssi: package.router_rssi,
            router_channel: package.router_channel,
            last_seen: now,
            uptime_ms: package.uptime_ms,
            gateway_ip: package.gateway_ip.clone(),
            timestamp: package.timestamp,
        };
        let connected = self.has_live_connections();
        let update = self.bridges.observe(info, connected, now);
        self.push_bridge_events(update);
        self.relay(&Package::BridgeStatus(package), None, Priority::Normal);
    }

    fn handle_bridge_status(&mut self, package: &BridgeStatusPackage, now: u32) {
        if package.from == self.node_id {
            return;
        }
        let info = BridgeInfo {
            node_id: package.from,
            internet_connected: package.internet_connected,
            router_rssi: package.router_rssi,
            router_channel: package.router_channel,
            last_seen: now,
            uptime_ms: package.uptime_ms,
            gateway_ip: package.gateway_ip.clone(),
            timestamp: package.timestamp,
        };
        let connected = self.has_live_connections();
        let update = self.bridges.observe(info, connected, now);
        self.push_bridge_events(update);
    }

    fn push_bridge_events(&mut self, update: BridgeUpdate) {
        if let Some((node, internet)) = update.status_changed {
            self.events.push_back(MeshEvent::BridgeStatusChanged { node, internet });
        }
        if let Some((old, new)) = update.primary_changed {
            self.events.push_back(MeshEvent::GatewayChanged { old, new });
        }
    }

    /// Route an application payload to the current primary gateway with
    /// acknowledgment, retries, and timeout. Returns the message id, or 0
    /// when the request could not be created (the callback still fires,
    /// from the next scheduler pass).
    pub fn send_to_internet(
        &mut self,
        destination_url: &str,
        payload: &str,
        callback: InternetCallback,
        priority: Option<Priority>,
    ) -> u32 {
        let now = self.clock.millis();
        let now_us = self.clock.micros();

        if !self.pending.enabled() {
            self.defer_result(Some(callback), false, 0, ERR_API_DISABLED);
            return 0;
        }
        let gateway = self.bridges.primary();
        if gateway == 0 {
            self.pending.stats_mut().failures_total += 1;
            self.defer_result(Some(callback), false, 0, ERR_NO_GATEWAY);
            return 0;
        }

        let message_id = self.pending.next_message_id(self.node_id);
        let request = PendingInternetRequest {
            message_id,
            created_at: now,
            retry_count: 0,
            max_retries: self.config.gateway.internet_retry_count,
            priority: priority.unwrap_or_default(),
            timeout_ms: self.config.gateway.internet_request_timeout_ms,
            retry_delay_ms: self.config.gateway.internet_retry_delay_ms,
            gateway_node: gateway,
            destination_url: destination_url.to_string(),
            payload: payload.to_string(),
            callback: Some(callback),
        };
        let first_retry_delay = request.next_retry_delay_ms();
        let timeout_ms = request.timeout_ms;
        self.pending.insert(request);

        self.send_gateway_data(message_id, now, now_us);
        self.scheduler.schedule_once(TaskKind::RequestTimeout(message_id), timeout_ms, now);
        self.scheduler.schedule_once(TaskKind::RequestRetry(message_id), first_retry_delay, now);
        message_id
    }

    fn send_gateway_data(&mut self, message_id: u32, _now: u32, now_us: u64) -> bool {
        let Some(request) = self.pending.get_mut(message_id) else {
            return false;
        };
        let package = Package::GatewayData(GatewayDataPackage {
            from: self.node_id,
            dest: request.gateway_node,
            message_id,
            origin: self.node_id,
            timestamp: self.node_time.node_time(now_us),
            priority: request.priority,
            destination_url: request.destination_url.clone(),
            payload: request.payload.clone(),
            content_type: "application/json".to_string(),
            retry_count: request.retry_count,
            requires_ack: true,
        });
        let gateway = request.gateway_node;
        let priority = request.priority;

        if gateway == self.node_id {
            // This node is the primary gateway: terminate locally.
            if let Package::GatewayData(data) = package {
                self.handle_gateway_data(data, self.clock.millis());
            }
            return true;
        }
        let route = find_route(self.connections.values(), gateway);
        match route {
            Some(route) => self.enqueue_package(route, &package, priority),
            None => {
                log::debug!("gw: no route to gateway {gateway} for request {message_id:#x}");
                false
            }
        }
    }

    fn run_request_retry(&mut self, message_id: u32, now: u32, now_us: u64) {
        let Some(request) = self.pending.get_mut(message_id) else {
            return;
        };
        request.retry_count += 1;
        if request.retry_count > request.max_retries {
            self.pending.stats_mut().failures_total += 1;
            self.fail_request(message_id, ERR_MAX_RETRIES);
            return;
        }
        self.pending.stats_mut().retries_total += 1;

        // The primary may have moved since the last attempt.
        let gateway = self.bridges.primary();
        let next_delay = {
            let request = match self.pending.get_mut(message_id) {
                Some(request) => request,
                None => return,
            };
            if gateway != 0 {
                request.gateway_node = gateway;
            }
            request.next_retry_delay_ms()
        };
        self.send_gateway_data(message_id, now, now_us);
        self.scheduler.schedule_once(TaskKind::RequestRetry(message_id), next_delay, now);
    }

    fn run_pending_sweep(&mut self, now: u32) {
        for message_id in self.pending.expired(now) {
            self.pending.stats_mut().timeouts_total += 1;
            self.fail_request(message_id, ERR_TIMED_OUT);
        }
    }

    fn fail_request(&mut self, message_id: u32, reason: &str) {
        if let Some(request) = self.pending.take(message_id) {
            log::debug!("gw: request {message_id:#x} failed: {reason}");
            self.defer_result(request.callback, false, 0, reason);
        }
    }

    fn handle_gateway_ack(&mut self, ack: &GatewayAckPackage) {
        if let Some(request) = self.pending.take(ack.message_id) {
            self.pending.stats_mut().acks_total += 1;
            self.defer_result(request.callback, ack.success, ack.http_status, &ack.error);
        }
    }

    fn handle_gateway_data(&mut self, package: GatewayDataPackage, now: u32) {
        if self.tracker.is_processed(package.message_id, package.origin, now) {
            self.stats.duplicates_dropped += 1;
            return;
        }
        self.tracker.mark_processed(package.message_id, package.origin, now);
        self.events.push_back(MeshEvent::GatewayData(package));
    }

    /// Gateway-side completion: answer a terminated Internet request back
    /// toward its originator.
    pub fn send_gateway_ack(
        &mut self,
        message_id: u32,
        origin: NodeId,
        success: bool,
        http_status: u16,
        error: &str,
    ) -> bool {
        let package = Package::GatewayAck(GatewayAckPackage {
            from: self.node_id,
            dest: origin,
            message_id,
            origin,
            success,
            http_status,
            error: error.to_string(),
            timestamp: self.node_time.node_time(self.clock.micros()),
        });
        if origin == self.node_id {
            if let Package::GatewayAck(ack) = &package {
                self.handle_gateway_ack(ack);
            }
            return true;
        }
        let route = find_route(self.connections.values(), origin);
        match route {
            Some(route) => self.enqueue_package(route, &package, Priority::High),
            None => false,
        }
    }

    pub fn cancel_internet_request(&mut self, message_id: u32) -> bool {
        if self.pending.contains(message_id) {
            self.pending.stats_mut().cancellations_total += 1;
            self.fail_request(message_id, ERR_CANCELLED);
            true
        } else {
            false
        }
    }

    /// Register the ACK path and start the timeout sweep.
    pub fn enable_send_to_internet(&mut self) {
        if self.pending.enabled() {
            return;
        }
        let now = self.clock.millis();
        self.pending.set_enabled(true);
        self.sweep_task = Some(self.scheduler.schedule_every(
            TaskKind::PendingSweep,
            self.config.gateway.pending_sweep_interval_ms,
            now,
        ));
        log::info!("gw: send-to-internet enabled");
    }

    /// Stop the sweep and fail every outstanding request.
    pub fn disable_send_to_internet(&mut self) {
        if !self.pending.enabled() {
            return;
        }
        self.pending.set_enabled(false);
        if let Some(task) = self.sweep_task.take() {
            self.scheduler.remove(task);
        }
        for request in self.pending.drain() {
            self.defer_result(request.callback, false, 0, ERR_API_DISABLED);
        }
        log::info!("gw: send-to-internet disabled");
    }

    fn defer_result(
        &mut self,
        callback: Option<InternetCallback>,
        success: bool,
        http_status: u16,
        error: &str,
    ) {
        if let Some(callback) = callback {
            self.deferred_results.push(DeferredResult {
                callback,
                success,
                http_status,
                error: error.to_string(),
            });
        }
    }

    // ------------------------------------------------------------- send API

    /// Best-effort single-destination send. False when no route exists or
    /// the buffer refuses the frame.
    pub fn send_single(&mut self, dest: NodeId, msg: &str, priority: Option<Priority>) -> bool {
        if dest == 0 || dest == self.node_id {
            return false;
        }
        let package = Package::Single(SinglePackage {
            from: self.node_id,
            dest,
            msg: msg.to_string(),
        });
        let route = find_route(self.connections.values(), dest);
        match route {
            Some(route) => self.enqueue_package(route, &package, priority.unwrap_or_default()),
            None => {
                self.stats.route_drops += 1;
                false
            }
        }
    }

    /// Fan a message out to the whole mesh. With `include_self` the local
    /// receive callback fires as well.
    pub fn send_broadcast(&mut self, msg: &str, priority: Option<Priority>, include_self: bool) -> bool {
        let package =
            Package::Broadcast(BroadcastPackage { from: self.node_id, msg: msg.to_string() });
        let sent = self.relay(&package, None, priority.unwrap_or_default());
        if include_self {
            self.events
                .push_back(MeshEvent::Receive { from: self.node_id, msg: msg.to_string() });
        }
        sent > 0 || include_self
    }

    // -------------------------------------------------------------- pumps

    fn pump_send(&mut self) -> bool {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        let mut did_work = false;
        for id in ids {
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };
            if !conn.is_active() || conn.send.is_empty() {
                continue;
            }
            let Some(transport) = conn.transport.as_mut() else {
                continue;
            };
            if !transport.can_send() {
                continue;
            }
            loop {
                let space = transport.space();
                let len = conn.send.request_length(space);
                if len == 0 {
                    break;
                }
                // Priority must be read before free_read retires the frame.
                let priority = conn.send.current_priority();
                let Some(view) = conn.send.read(len) else {
                    break;
                };
                let accepted = transport.write(view);
                debug_assert_eq!(accepted, view.len());
                if priority.is_some_and(Priority::wants_flush) {
                    transport.flush();
                }
                conn.send.free_read();
                did_work = true;
            }
        }
        did_work
    }

    fn drain_deferred_results(&mut self) -> bool {
        if self.deferred_results.is_empty() {
            return false;
        }
        for mut result in std::mem::take(&mut self.deferred_results) {
            (result.callback)(result.success, result.http_status, &result.error);
        }
        true
    }

    fn drain_events(&mut self) -> bool {
        if self.events.is_empty() {
            return false;
        }
        while let Some(event) = self.events.pop_front() {
            self.callbacks.fire(&event);
        }
        true
    }

    // ----------------------------------------------------------- inspection

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn set_root(&mut self, root: bool) {
        self.root = root;
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    pub fn set_time_authority(&mut self, authority: bool) {
        self.time_authority = authority;
    }

    pub fn has_time_authority(&self) -> bool {
        self.time_authority
    }

    /// Nodes with an RTC (or external time) anchor the distributed clock.
    pub fn set_rtc_time(&mut self, unix_time: u64) {
        self.time_authority = true;
        self.events.push_back(MeshEvent::RtcSyncComplete(unix_time));
    }

    pub fn set_bridge_capable(&mut self, capable: bool) {
        let now = self.clock.millis();
        if capable && !self.bridge_capable {
            self.scheduler.schedule_every(
                TaskKind::BridgeHeartbeat,
                self.config.gateway.bridge_status_interval_ms,
                now,
            );
        }
        self.bridge_capable = capable;
    }

    pub fn node_time(&self) -> u32 {
        self.node_time.node_time(self.clock.micros())
    }

    pub fn topology(&self) -> Tree {
        self.build_tree(None)
    }

    pub fn node_list(&self, include_self: bool) -> Vec<NodeId> {
        self.build_tree(None).as_list(include_self)
    }

    pub fn is_connected(&self, node_id: NodeId) -> bool {
        self.build_tree(None).contains(node_id)
    }

    pub fn has_live_connections(&self) -> bool {
        self.connections.values().any(Connection::is_established)
    }

    /// Destination -> adjacent next hop, for every reachable node.
    pub fn routing_table(&self) -> BTreeMap<NodeId, NodeId> {
        let mut table = BTreeMap::new();
        for conn in self.connections.values() {
            if !conn.is_established() {
                continue;
            }
            for node in conn.subtree.as_list(true) {
                table.entry(node).or_insert(conn.peer);
            }
        }
        table
    }

    /// Path from self to `node_id`, inclusive; `[self]` for self.
    pub fn path_to_node(&self, node_id: NodeId) -> Option<Vec<NodeId>> {
        self.build_tree(None).path_to(node_id)
    }

    pub fn hop_count(&self, node_id: NodeId) -> Option<u32> {
        self.build_tree(None).hops_to(node_id)
    }

    pub fn connection_reports(&self) -> Vec<ConnectionReport> {
        let rssi = self.wifi.rssi();
        self.connections.values().map(|conn| conn.report(rssi)).collect()
    }

    pub fn stats(&self) -> &MeshStats {
        &self.stats
    }

    // Gateway/bridge surface.

    pub fn primary_gateway(&self) -> NodeId {
        self.bridges.primary()
    }

    pub fn is_primary_gateway(&self) -> bool {
        self.node_id != 0 && self.bridges.primary() == self.node_id
    }

    pub fn gateways(&self) -> Vec<BridgeInfo> {
        self.bridges.gateways()
    }

    pub fn gateway_count(&self) -> usize {
        self.bridges.count()
    }

    pub fn pending_internet_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn gateway_stats(&self) -> crate::gateway::GatewayStats {
        self.pending.stats().clone()
    }

    // Internet health surface.

    pub fn set_internet_probe(&mut self, probe: Box<dyn InternetProbe>) {
        self.health.set_probe(probe);
    }

    pub fn set_mock_internet(&mut self, available: Option<bool>) {
        self.health.set_mock_internet(available);
        // Mock results resolve instantly; reflect the transition without
        // waiting for the next probe interval.
        if available.is_some() {
            let now = self.clock.millis();
            if let Some(transition) = self.health.start_check(now) {
                self.events.push_back(MeshEvent::LocalInternetChanged(transition));
            }
        }
    }

    pub fn internet_status(&self) -> &InternetStatus {
        self.health.status()
    }

    // Offline queue surface.

    pub fn queue_offline(
        &mut self,
        payload: &str,
        destination: &str,
        priority: Priority,
    ) -> Result<u64, MeshError> {
        let now = self.clock.millis();
        self.queue.enqueue(payload, destination, priority, now)
    }

    pub fn flush_offline<F: FnMut(&str, &str) -> bool>(&mut self, send: F) -> FlushReport {
        self.queue.flush(send)
    }

    pub fn prune_offline(&mut self, max_age_hours: u32) -> usize {
        let now = self.clock.millis();
        self.queue.prune(max_age_hours, now)
    }

    pub fn offline_queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn offline_queue_level(&self) -> FillLevel {
        self.queue.level()
    }

    pub fn offline_queue_stats(&self) -> &QueueStats {
        self.queue.stats()
    }

    pub fn offline_messages(&self) -> Vec<QueuedMessage> {
        self.queue.messages()
    }

    pub fn on_queue_level_change(&mut self, callback: Box<dyn FnMut(FillLevel, usize) + Send>) {
        self.queue.on_level_change(callback);
    }

    // Callback registration.

    pub fn on_package(&mut self, tag: u8, handler: PackageHandler) {
        self.handlers.register(tag, handler);
    }

    pub fn on_new_connection(&mut self, cb: Box<dyn FnMut(NodeId) + Send>) {
        self.callbacks.on_new_connection(cb);
    }

    pub fn on_dropped_connection(&mut self, cb: Box<dyn FnMut(NodeId, bool) + Send>) {
        self.callbacks.on_dropped_connection(cb);
    }

    pub fn on_changed_connections(&mut self, cb: Box<dyn FnMut() + Send>) {
        self.callbacks.on_changed_connections(cb);
    }

    pub fn on_receive(&mut self, cb: Box<dyn FnMut(NodeId, &str) + Send>) {
        self.callbacks.on_receive(cb);
    }

    pub fn on_node_time_adjusted(&mut self, cb: Box<dyn FnMut(i32) + Send>) {
        self.callbacks.on_node_time_adjusted(cb);
    }

    pub fn on_node_delay_received(&mut self, cb: Box<dyn FnMut(NodeId, u32) + Send>) {
        self.callbacks.on_node_delay_received(cb);
    }

    pub fn on_bridge_status_changed(&mut self, cb: Box<dyn FnMut(NodeId, bool) + Send>) {
        self.callbacks.on_bridge_status_changed(cb);
    }

    pub fn on_gateway_changed(&mut self, cb: Box<dyn FnMut(NodeId, NodeId) + Send>) {
        self.callbacks.on_gateway_changed(cb);
    }

    pub fn on_local_internet_changed(&mut self, cb: Box<dyn FnMut(bool) + Send>) {
        self.callbacks.on_local_internet_changed(cb);
    }

    pub fn on_rtc_sync_complete(&mut self, cb: Box<dyn FnMut(u64) + Send>) {
        self.callbacks.on_rtc_sync_complete(cb);
    }

    pub fn on_gateway_data(&mut self, cb: Box<dyn FnMut(&GatewayDataPackage) + Send>) {
        self.callbacks.on_gateway_data(cb);
    }
}
