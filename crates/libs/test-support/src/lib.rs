//! Shared test harness for the canopy workspace: a hand-cranked clock,
//! in-memory transports, and a multi-node mesh simulator.
//!
//! Nothing here touches a real socket or the wall clock, so every suite
//! built on it is deterministic.

pub mod clock;
pub mod sim;
pub mod transport;

pub use clock::ManualClock;
pub use sim::MeshSim;
pub use transport::{linked_pair, LinkHandle, LinkedTransport, QueueConnector};
