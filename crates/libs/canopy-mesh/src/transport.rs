//! Collaborator seams: the byte transport, its factory, and the Wi-Fi
//! driver.
//!
//! The core never blocks on a socket. A transport buffers whatever its
//! backend produced and hands it over when the mesh polls it during
//! `update()`; writes must accept up to `space()` bytes without blocking.
//! This poll-shaped seam is what keeps the core single-threaded and
//! deterministic under test.

/// Completed transport activity, drained per update pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Outbound connect finished (station side) or accept completed.
    Connected,
    /// Bytes received from the peer.
    Data(Vec<u8>),
    /// Bytes acknowledged by the peer stack.
    Sent(usize),
    /// Orderly close by either side.
    Disconnected,
    /// Transport-level failure with a backend error code.
    Error(i32),
}

pub trait Transport: Send {
    /// Drain pending events. Called once per connection per update pass.
    fn poll(&mut self) -> Vec<TransportEvent>;

    /// Accept bytes for transmission; returns the count accepted. Callers
    /// never offer more than `space()`, so a conforming implementation
    /// accepts the full slice.
    fn write(&mut self, bytes: &[u8]) -> usize;

    /// Push buffered bytes to the wire now.
    fn flush(&mut self);

    /// Write capacity currently available.
    fn space(&self) -> usize;

    fn can_send(&self) -> bool;

    fn connected(&self) -> bool;

    /// Orderly shutdown request.
    fn close(&mut self);

    /// Hard teardown when `close` cannot complete.
    fn abort(&mut self);

    /// True once the backend holds no internal references and the handle
    /// may be dropped.
    fn freeable(&self) -> bool;
}

/// Opens outbound transports toward a peer's AP address.
pub trait TransportFactory: Send {
    /// Begin an async connect; progress arrives via `poll` on the returned
    /// transport (`Connected` or `Error`).
    fn connect(&mut self, ip: [u8; 4], port: u16) -> Box<dyn Transport>;
}

/// The station/AP radio the node runs on.
pub trait WifiDriver: Send {
    /// RSSI toward the upstream router, in dBm.
    fn rssi(&self) -> i8;

    /// Channel of the upstream router.
    fn channel(&self) -> u8;

    /// Address of the upstream IP gateway, `[0,0,0,0]` when offline.
    fn gateway_ip(&self) -> [u8; 4];

    /// Ask the driver to drop and re-establish the station link. Fired
    /// after connect-retry exhaustion.
    fn request_reconnect(&mut self);
}

/// Driver stub for hosts without a radio: neutral RSSI, no gateway.
#[derive(Debug, Default)]
pub struct NullWifi {
    reconnect_requests: u32,
}

impl NullWifi {
    pub fn reconnect_requests(&self) -> u32 {
        self.reconnect_requests
    }
}

impl WifiDriver for NullWifi {
    fn rssi(&self) -> i8 {
        0
    }

    fn channel(&self) -> u8 {
        0
    }

    fn gateway_ip(&self) -> [u8; 4] {
        [0, 0, 0, 0]
    }

    fn request_reconnect(&mut self) {
        self.reconnect_requests += 1;
    }
}
