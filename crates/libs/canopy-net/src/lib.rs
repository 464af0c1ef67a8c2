//! Tokio-backed implementations of the mesh collaborator traits.
//!
//! The core is synchronous and poll-driven; these adapters run the actual
//! sockets on a tokio runtime and ferry completions across thread-safe
//! queues that the core drains during `update()`.

pub mod probe;
pub mod tcp;

pub use probe::TcpProbe;
pub use tcp::{TcpAcceptor, TcpConnector, TcpTransport};
