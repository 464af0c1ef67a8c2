//! Canopy mesh core.
//!
//! A self-forming, self-healing tree mesh for constrained nodes: every
//! node is client and access point at once, NUL-framed JSON packages are
//! routed point-to-point or broadcast over the tree, a distributed clock
//! is kept in sync, and elected gateway nodes bridge the mesh to the
//! Internet with acknowledged, retried delivery.
//!
//! The core is synchronous and cooperative: the host calls
//! [`MeshCore::update`] from its loop, and everything (transport polls,
//! protocol timers, send pumps, user callbacks) happens inside that pass.
//! Transports, the Wi-Fi driver, and the Internet probe are collaborator
//! traits; `canopy-net` provides tokio-backed implementations.

pub mod bridge;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod gateway;
pub mod health;
pub mod mesh;
pub mod queue;
pub mod router;
pub mod scheduler;
pub mod teardown;
pub mod timesync;
pub mod tracker;
pub mod transport;

pub use bridge::{BridgeInfo, BridgeTracker};
pub use canopy_proto::{meship, NodeId, Package, Priority, Tree};
pub use clock::{Clock, SystemClock};
pub use config::{GatewayConfig, HealthConfig, MeshConfig, QueueConfig};
pub use connection::{ConnectionId, ConnectionReport, ConnectionRole, ConnectionState};
pub use error::MeshError;
pub use gateway::{GatewayStats, InternetCallback};
pub use health::{InternetProbe, InternetStatus};
pub use mesh::MeshCore;
pub use queue::{FillLevel, FlushReport, QueueStats, QueuedMessage};
pub use router::{MeshStats, PackageHandler};
pub use transport::{NullWifi, Transport, TransportEvent, TransportFactory, WifiDriver};
