//! Canopy wire protocol: NUL-framed JSON packages exchanged between
//! adjacent mesh nodes.
//!
//! A frame on the wire is one JSON object terminated by a NUL byte. The
//! envelope carries `type`, `from` and (for single-destination packages)
//! `dest`; everything else is variant-specific. Framing itself (NUL
//! splitting, priority queues) lives in `canopy-mesh`; this crate only
//! defines the package vocabulary and its JSON form.

pub mod meship;
pub mod tree;
pub mod wire;

/// 32-bit node identifier derived from the last four bytes of the device
/// hardware address. 0 is reserved for "unknown/any" and never names a peer.
pub type NodeId = u32;

pub use tree::Tree;
pub use wire::{
    BridgeStatusPackage, BroadcastPackage, CustomPackage, GatewayAckPackage, GatewayDataPackage,
    NodeSyncPackage, Package, PackageType, Priority, ProtoError, SinglePackage, TimeDelayPackage,
    TimeSyncPackage, TimeSyncStep, USER_TYPE_MIN,
};
