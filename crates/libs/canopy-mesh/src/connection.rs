//! One bidirectional link to an adjacent node.
//!
//! A connection owns its transport handle and both framed buffers. The
//! peer NodeId stays 0 until the first NodeSync reply names it; the peer's
//! advertised subtree is stored here and consulted for route lookups.

use std::collections::VecDeque;

use canopy_proto::{NodeId, Tree};

use crate::buffer::{ReceiveBuffer, SendBuffer};
use crate::scheduler::TaskId;
use crate::timesync::TimeSyncSession;
use crate::transport::Transport;

pub type ConnectionId = u32;

/// Which side of the link this node is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// We connected out to the peer's AP.
    Station,
    /// The peer connected in to our AP.
    Ap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
}

/// Rolling link quality inputs and frame counters. Every send attempt
/// lands in exactly one of `messages_tx` or `messages_dropped`.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub messages_rx: u32,
    pub messages_tx: u32,
    pub messages_dropped: u32,
    latency_samples: VecDeque<u32>,
}

const LATENCY_WINDOW: usize = 10;

impl ConnectionStats {
    pub fn record_latency_ms(&mut self, sample_ms: u32) {
        if self.latency_samples.len() == LATENCY_WINDOW {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(sample_ms);
    }

    pub fn mean_latency_ms(&self) -> Option<u32> {
        if self.latency_samples.is_empty() {
            return None;
        }
        let sum: u64 = self.latency_samples.iter().map(|&s| s as u64).sum();
        Some((sum / self.latency_samples.len() as u64) as u32)
    }

    pub fn loss_percent(&self) -> u32 {
        let attempts = self.messages_tx + self.messages_dropped;
        if attempts == 0 {
            0
        } else {
            self.messages_dropped * 100 / attempts
        }
    }
}

/// Scheduler handles for the three per-connection protocol timers.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTasks {
    pub node_sync: TaskId,
    pub time_sync: TaskId,
    pub timeout: TaskId,
}

pub struct Connection {
    pub id: ConnectionId,
    pub peer: NodeId,
    pub role: ConnectionRole,
    pub state: ConnectionState,
    pub transport: Option<Box<dyn Transport>>,
    pub recv: ReceiveBuffer,
    pub send: SendBuffer,
    /// Peer's advertised subtree; placeholder with node_id 0 until the
    /// first NodeSync.
    pub subtree: Tree,
    pub stats: ConnectionStats,
    pub time_sync: TimeSyncSession,
    pub tasks: Option<ConnectionTasks>,
    /// Station-side connect target, kept for retries.
    pub target_ip: Option<[u8; 4]>,
    pub connect_retries: u8,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        role: ConnectionRole,
        transport: Box<dyn Transport>,
        target_ip: Option<[u8; 4]>,
        send_queue_max_frames: usize,
    ) -> Self {
        let state =
            if transport.connected() { ConnectionState::Active } else { ConnectionState::Connecting };
        Self {
            id,
            peer: 0,
            role,
            state,
            transport: Some(transport),
            recv: ReceiveBuffer::new(),
            send: SendBuffer::new(send_queue_max_frames),
            subtree: Tree::new(0),
            stats: ConnectionStats::default(),
            time_sync: TimeSyncSession::default(),
            tasks: None,
            target_ip,
            connect_retries: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }

    /// True once the peer has identified itself via NodeSync.
    pub fn is_established(&self) -> bool {
        self.is_active() && self.peer != 0
    }

    /// Link quality in [0, 100]: 100 minus latency, loss, and weak-RSSI
    /// penalties.
    pub fn quality(&self, rssi: i8) -> u8 {
        let mut score: i32 = 100;
        if let Some(latency) = self.stats.mean_latency_ms() {
            if latency > 100 {
                score -= ((latency - 100) / 5) as i32;
            }
        }
        score -= self.stats.loss_percent() as i32;
        if rssi < -80 {
            score -= -80 - rssi as i32;
        }
        score.clamp(0, 100) as u8
    }
}

/// Point-in-time snapshot handed to user code; never a live reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionReport {
    pub id: ConnectionId,
    pub peer: NodeId,
    pub role: ConnectionRole,
    pub state: ConnectionState,
    pub quality: u8,
    pub messages_rx: u32,
    pub messages_tx: u32,
    pub messages_dropped: u32,
    pub mean_latency_ms: Option<u32>,
    pub subtree_size: usize,
}

impl Connection {
    pub fn report(&self, rssi: i8) -> ConnectionReport {
        ConnectionReport {
            id: self.id,
            peer: self.peer,
            role: self.role,
            state: self.state,
            quality: self.quality(rssi),
            messages_rx: self.stats.messages_rx,
            messages_tx: self.stats.messages_tx,
            messages_dropped: self.stats.messages_dropped,
            mean_latency_ms: self.stats.mean_latency_ms(),
            subtree_size: if self.peer == 0 { 0 } else { self.subtree.size() },
        }
    }
}
