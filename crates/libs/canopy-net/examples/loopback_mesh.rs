//! Two mesh nodes on one machine, wired over real loopback TCP: node 100
//! dials node 200's listener, the NodeSync handshake runs, and a broadcast
//! crosses the link.
//!
//! Run with `cargo run -p canopy-net --example loopback_mesh`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use canopy_mesh::{meship, MeshConfig, MeshCore};
use canopy_net::{TcpAcceptor, TcpConnector};

fn main() {
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let handle = runtime.handle().clone();

    let bind_addr = format!("127.0.0.1:{}", meship::MESH_PORT);
    let mut acceptor =
        TcpAcceptor::bind(&handle, bind_addr.parse().expect("listen addr")).expect("bind listener");

    let mut gateway_node = MeshCore::new(MeshConfig::default());
    gateway_node.init(200);

    let mut leaf_node =
        MeshCore::new(MeshConfig::default()).with_transport_factory(Box::new(TcpConnector::new(handle)));
    leaf_node.init(100);

    let delivered = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&delivered);
    gateway_node.on_receive(Box::new(move |from, msg| {
        println!("node 200 received {msg:?} from {from}");
        flag.store(true, Ordering::SeqCst);
    }));

    // The listener is local, so any address decodes; the mesh port does the
    // real work here.
    leaf_node.connect_to([127, 0, 0, 1]).expect("dial listener");

    let mut sent = false;
    let deadline = Instant::now() + Duration::from_secs(10);
    while !delivered.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "mesh never converged");
        if let Some(transport) = acceptor.try_accept() {
            gateway_node.accept_connection(Box::new(transport));
        }
        leaf_node.update();
        gateway_node.update();

        if !sent && leaf_node.is_connected(200) {
            println!("node 100 sees the mesh: {:?}", leaf_node.node_list(true));
            leaf_node.send_broadcast("hello from 100", None, false);
            sent = true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    leaf_node.stop();
    gateway_node.stop();
    println!("done");
}
