use canopy_proto::{NodeId, ProtoError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("no route to node {0}")]
    NoRoute(NodeId),

    #[error("connection {0} not found")]
    UnknownConnection(u32),

    #[error("send buffer rejected the frame")]
    BufferRejected,

    #[error("offline queue is full")]
    QueueFull,

    #[error("no transport factory configured")]
    NoFactory,

    #[error("peer {0} is temporarily blocklisted")]
    Blocklisted(NodeId),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<ProtoError> for MeshError {
    fn from(err: ProtoError) -> Self {
        MeshError::Decode(err.to_string())
    }
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::Io(err.to_string())
    }
}
