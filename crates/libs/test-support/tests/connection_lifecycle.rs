//! Connect retry, blocklisting, and silence timeouts on single nodes.

use canopy_mesh::{MeshConfig, MeshCore, MeshError};
use canopy_proto::meship;
use test_support::{linked_pair, ManualClock, QueueConnector};

fn mesh_with(clock: &ManualClock, connector: &QueueConnector) -> MeshCore {
    let mut mesh = MeshCore::new(MeshConfig::default())
        .with_clock(Box::new(clock.clone()))
        .with_transport_factory(Box::new(connector.clone()));
    mesh.init(1);
    mesh
}

#[test]
fn connect_retries_back_off_then_blocklist() {
    let clock = ManualClock::new();
    clock.set_ms(1);
    let connector = QueueConnector::new();
    let mut mesh = mesh_with(&clock, &connector);

    // Nothing staged: every attempt yields a transport that errors out.
    mesh.connect_to(meship::ap_ip_for(2)).expect("initial connect");

    // Retries land at +1s, +3s, +7s, +15s, +23s (backoff capped at 8x).
    for _ in 0..120 {
        clock.advance_ms(250);
        mesh.update();
    }
    assert_eq!(connector.attempts().len(), 6);
    assert!(mesh.connection_reports().is_empty());

    // The peer is now blocklisted.
    assert!(matches!(
        mesh.connect_to(meship::ap_ip_for(2)),
        Err(MeshError::Blocklisted(2))
    ));

    // The block expires after its window.
    for _ in 0..130 {
        clock.advance_ms(500);
        mesh.update();
    }
    assert!(mesh.connect_to(meship::ap_ip_for(2)).is_ok());
}

#[test]
fn connect_without_factory_is_an_error() {
    let mut mesh = MeshCore::new(MeshConfig::default());
    mesh.init(1);
    assert!(matches!(mesh.connect_to([10, 0, 2, 1]), Err(MeshError::NoFactory)));
}

#[test]
fn silent_link_closes_on_node_timeout() {
    let clock = ManualClock::new();
    clock.set_ms(1);
    let connector = QueueConnector::new();
    let mut mesh = mesh_with(&clock, &connector);

    // A live transport whose far side never answers.
    let (near, _far, _near_handle, _far_handle) = linked_pair();
    mesh.accept_connection(Box::new(near));
    mesh.update();
    assert_eq!(mesh.connection_reports().len(), 1);

    // Default silence threshold is twice the sync interval.
    for _ in 0..125 {
        clock.advance_ms(1_000);
        mesh.update();
    }
    assert!(mesh.connection_reports().is_empty());
}

#[test]
fn stop_closes_everything_and_fails_pending() {
    let clock = ManualClock::new();
    clock.set_ms(1);
    let connector = QueueConnector::new();
    let mut mesh = mesh_with(&clock, &connector);

    let (near, _far, _near_handle, _far_handle) = linked_pair();
    mesh.accept_connection(Box::new(near));
    mesh.update();

    use std::sync::{Arc, Mutex};
    let results: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);
    mesh.enable_send_to_internet();
    // No gateway exists; the request fails from the scheduler. Either
    // way, stop() must leave nothing pending.
    mesh.send_to_internet(
        "https://x",
        "p",
        Box::new(move |_, _, err| sink.lock().expect("results").push(err.to_string())),
        None,
    );

    mesh.stop();
    assert!(!mesh.is_started());
    assert!(mesh.connection_reports().is_empty());
    assert_eq!(mesh.pending_internet_requests(), 0);
    assert_eq!(results.lock().expect("results").len(), 1);
}
