//! Bridge tracking, primary election, and the send-to-internet lifecycle
//! across simulated nodes.

use std::sync::{Arc, Mutex};

use canopy_mesh::{GatewayConfig, MeshConfig, NodeId, TransportEvent};
use canopy_proto::{BridgeStatusPackage, Package};
use test_support::{LinkHandle, MeshSim};

type Results = Arc<Mutex<Vec<(bool, u16, String)>>>;

fn result_recorder() -> (Results, canopy_mesh::InternetCallback) {
    let results: Results = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);
    let callback = Box::new(move |success: bool, http: u16, error: &str| {
        sink.lock().expect("results").push((success, http, error.to_string()));
    });
    (results, callback)
}

/// Frame a BridgeStatus as if relayed from elsewhere in the mesh.
fn inject_bridge_status(handle: &LinkHandle, node: NodeId, rssi: i8, internet: bool) {
    let package = Package::BridgeStatus(BridgeStatusPackage {
        from: node,
        internet_connected: internet,
        router_rssi: rssi,
        router_channel: 1,
        uptime_ms: 1_000,
        gateway_ip: "192.168.0.1".into(),
        timestamp: 0,
    });
    let mut frame = package.encode();
    frame.push(0);
    handle.inject(TransportEvent::Data(frame));
}

fn small_bridge_table() -> MeshConfig {
    MeshConfig {
        gateway: GatewayConfig { max_known_bridges: 3, ..GatewayConfig::default() },
        ..MeshConfig::default()
    }
}

#[test]
fn bridge_overflow_evicts_worst_rssi() {
    let mut sim = MeshSim::with_config(&[100, 200], small_bridge_table());
    let (station_handle, _) = sim.link_with_handles(100, 200);
    sim.settle(4);

    inject_bridge_status(&station_handle, 10, -50, true);
    inject_bridge_status(&station_handle, 20, -70, true);
    inject_bridge_status(&station_handle, 30, -60, true);
    sim.settle(4);
    assert_eq!(sim.node_ref(100).gateway_count(), 3);

    inject_bridge_status(&station_handle, 40, -65, true);
    sim.settle(2);

    let mut ids: Vec<NodeId> =
        sim.node_ref(100).gateways().iter().map(|b| b.node_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![10, 30, 40]);
}

#[test]
fn gateway_change_fires_on_every_primary_transition() {
    let mut sim = MeshSim::new(&[100, 200]);
    let transitions: Arc<Mutex<Vec<(NodeId, NodeId)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let sink = Arc::clone(&transitions);
        sim.node(100).on_gateway_changed(Box::new(move |old, new| {
            sink.lock().expect("transitions").push((old, new));
        }));
    }
    let (station_handle, _) = sim.link_with_handles(100, 200);
    sim.settle(4);

    inject_bridge_status(&station_handle, 10, -50, true);
    sim.settle(2);
    assert_eq!(sim.node_ref(100).primary_gateway(), 10);

    inject_bridge_status(&station_handle, 20, -30, true);
    sim.settle(2);
    assert_eq!(sim.node_ref(100).primary_gateway(), 20);

    inject_bridge_status(&station_handle, 20, -30, false);
    sim.settle(2);
    assert_eq!(sim.node_ref(100).primary_gateway(), 10);

    assert_eq!(
        *transitions.lock().expect("transitions"),
        vec![(0, 10), (10, 20), (20, 10)]
    );
}

#[test]
fn bridge_heartbeat_elects_the_gateway_node() {
    let mut sim = MeshSim::new(&[100, 200]);
    sim.link(100, 200);
    sim.settle(4);

    sim.node(200).set_mock_internet(Some(true));
    sim.node(200).set_bridge_capable(true);
    sim.run_ms(1_000, 500);

    assert_eq!(sim.node_ref(100).primary_gateway(), 200);
    assert!(sim.node_ref(200).is_primary_gateway());
    assert!(!sim.node_ref(100).is_primary_gateway());
}

#[test]
fn send_to_internet_happy_path_acks_exactly_once() {
    let mut sim = MeshSim::new(&[100, 200]);
    sim.link(100, 200);
    sim.settle(4);
    sim.node(200).set_mock_internet(Some(true));
    sim.node(200).set_bridge_capable(true);
    sim.run_ms(1_000, 500);

    // Gateway-side terminator records what it must answer.
    let seen: Arc<Mutex<Vec<(u32, NodeId)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let sink = Arc::clone(&seen);
        sim.node(200).on_gateway_data(Box::new(move |data| {
            sink.lock().expect("gateway data").push((data.message_id, data.origin));
        }));
    }

    sim.node(100).enable_send_to_internet();
    let (results, callback) = result_recorder();
    let message_id =
        sim.node(100).send_to_internet("https://example.org", "{\"t\":1}", callback, None);
    assert_ne!(message_id, 0);
    assert_eq!(message_id >> 16, 100);
    sim.settle(4);

    let (seen_id, seen_origin) = seen.lock().expect("gateway data")[0];
    assert_eq!((seen_id, seen_origin), (message_id, 100));

    assert!(sim.node(200).send_gateway_ack(message_id, 100, true, 200, ""));
    sim.settle(4);

    assert_eq!(*results.lock().expect("results"), vec![(true, 200, String::new())]);
    assert_eq!(sim.node_ref(100).pending_internet_requests(), 0);

    // A straggler ACK for the same id is ignored.
    sim.node(200).send_gateway_ack(message_id, 100, true, 200, "");
    sim.run_ms(20_000, 1_000);
    assert_eq!(results.lock().expect("results").len(), 1);
}

#[test]
fn send_to_internet_without_gateway_fails_from_scheduler() {
    let mut sim = MeshSim::new(&[100, 200]);
    sim.link(100, 200);
    sim.settle(4);

    sim.node(100).enable_send_to_internet();
    let (results, callback) = result_recorder();
    let message_id = sim.node(100).send_to_internet("https://x", "p", callback, None);
    assert_eq!(message_id, 0);
    // Never synchronously with the call.
    assert!(results.lock().expect("results").is_empty());

    sim.settle(1);
    assert_eq!(
        *results.lock().expect("results"),
        vec![(false, 0, "No gateway available".to_string())]
    );
}

#[test]
fn send_to_internet_retry_exhaustion_fails_once() {
    let mut sim = MeshSim::new(&[100, 200]);
    let (station_handle, _) = sim.link_with_handles(100, 200);
    sim.settle(4);
    // The neighbour is advertised as a bridge, but nothing ever ACKs.
    inject_bridge_status(&station_handle, 200, -40, true);
    sim.settle(2);
    assert_eq!(sim.node_ref(100).primary_gateway(), 200);

    sim.node(100).enable_send_to_internet();
    let (results, callback) = result_recorder();
    let message_id = sim.node(100).send_to_internet("https://x", "p", callback, None);
    assert_ne!(message_id, 0);

    // Backoff schedule: retries at +1s, +3s, +7s, failing attempt at +15s.
    sim.run_ms(16_000, 250);
    assert_eq!(
        *results.lock().expect("results"),
        vec![(false, 0, "Max retries exceeded".to_string())]
    );
    assert_eq!(sim.node_ref(100).pending_internet_requests(), 0);

    // Nothing further fires, even after the timeout sweep horizon.
    sim.run_ms(40_000, 1_000);
    assert_eq!(results.lock().expect("results").len(), 1);
}

#[test]
fn send_to_internet_times_out_when_retries_continue() {
    let config = MeshConfig {
        gateway: GatewayConfig { internet_retry_count: 20, ..GatewayConfig::default() },
        ..MeshConfig::default()
    };
    let mut sim = MeshSim::with_config(&[100, 200], config);
    let (station_handle, _) = sim.link_with_handles(100, 200);
    sim.settle(4);
    inject_bridge_status(&station_handle, 200, -40, true);
    sim.settle(2);

    sim.node(100).enable_send_to_internet();
    let (results, callback) = result_recorder();
    sim.node(100).send_to_internet("https://x", "p", callback, None);

    sim.run_ms(31_000, 500);
    assert_eq!(
        *results.lock().expect("results"),
        vec![(false, 0, "Request timed out".to_string())]
    );
}

#[test]
fn cancel_fires_cancellation_exactly_once() {
    let mut sim = MeshSim::new(&[100, 200]);
    let (station_handle, _) = sim.link_with_handles(100, 200);
    sim.settle(4);
    inject_bridge_status(&station_handle, 200, -40, true);
    sim.settle(2);

    sim.node(100).enable_send_to_internet();
    let (results, callback) = result_recorder();
    let message_id = sim.node(100).send_to_internet("https://x", "p", callback, None);

    assert!(sim.node(100).cancel_internet_request(message_id));
    assert!(!sim.node(100).cancel_internet_request(message_id));
    sim.run_ms(40_000, 1_000);

    assert_eq!(
        *results.lock().expect("results"),
        vec![(false, 0, "Request cancelled".to_string())]
    );
}

#[test]
fn disable_fails_outstanding_requests() {
    let mut sim = MeshSim::new(&[100, 200]);
    let (station_handle, _) = sim.link_with_handles(100, 200);
    sim.settle(4);
    inject_bridge_status(&station_handle, 200, -40, true);
    sim.settle(2);

    sim.node(100).enable_send_to_internet();
    let (results, callback) = result_recorder();
    sim.node(100).send_to_internet("https://x", "p", callback, None);

    sim.node(100).disable_send_to_internet();
    sim.settle(2);
    assert_eq!(
        *results.lock().expect("results"),
        vec![(false, 0, "API disabled".to_string())]
    );

    // While disabled, new requests fail the same way.
    let (more_results, callback) = result_recorder();
    assert_eq!(sim.node(100).send_to_internet("https://x", "p", callback, None), 0);
    sim.settle(1);
    assert_eq!(
        *more_results.lock().expect("results"),
        vec![(false, 0, "API disabled".to_string())]
    );
}

#[test]
fn primary_gateway_terminates_its_own_requests_locally() {
    let mut sim = MeshSim::new(&[100]);
    sim.node(100).set_mock_internet(Some(true));
    sim.node(100).set_bridge_capable(true);
    sim.run_ms(1_000, 500);
    assert!(sim.node_ref(100).is_primary_gateway());

    let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let sink = Arc::clone(&seen);
        sim.node(100).on_gateway_data(Box::new(move |data| {
            sink.lock().expect("gateway data").push(data.message_id);
        }));
    }

    sim.node(100).enable_send_to_internet();
    let (results, callback) = result_recorder();
    let message_id = sim.node(100).send_to_internet("https://x", "p", callback, None);
    sim.settle(2);
    assert_eq!(*seen.lock().expect("gateway data"), vec![message_id]);

    sim.node(100).send_gateway_ack(message_id, 100, true, 204, "");
    sim.settle(2);
    assert_eq!(*results.lock().expect("results"), vec![(true, 204, String::new())]);
}

#[test]
fn duplicate_gateway_data_is_suppressed_at_the_gateway() {
    let mut sim = MeshSim::new(&[100, 200]);
    let (station_handle, _) = sim.link_with_handles(100, 200);
    sim.settle(4);
    inject_bridge_status(&station_handle, 200, -40, true);
    sim.settle(2);

    let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let sink = Arc::clone(&seen);
        sim.node(200).on_gateway_data(Box::new(move |data| {
            sink.lock().expect("gateway data").push(data.message_id);
        }));
    }

    sim.node(100).enable_send_to_internet();
    let (_results, callback) = result_recorder();
    sim.node(100).send_to_internet("https://x", "p", callback, None);

    // Two retries re-send the same message id; the gateway sees it once.
    sim.run_ms(4_000, 250);
    assert_eq!(seen.lock().expect("gateway data").len(), 1);
}
