//! Typed configuration passed at initialization. Every tunable carries the
//! protocol default; hosts override fields before handing the record to
//! [`crate::MeshCore::new`].

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    /// NodeSync exchange period per connection.
    pub node_sync_interval_ms: u32,
    /// First-sync stagger on AP-side connections.
    pub node_sync_ap_stagger_ms: u32,
    /// Silence threshold after which a connection is closed. Floor is twice
    /// the sync interval.
    pub node_timeout_ms: u32,
    /// Clock offset exchange period per connection.
    pub time_sync_interval_ms: u32,
    /// Delay before the first offset exchange on a fresh connection.
    pub time_sync_initial_delay_ms: u32,

    pub tcp_connect_max_retries: u8,
    pub tcp_connect_retry_delay_ms: u32,
    /// Cap applied to the exponential backoff multiplier.
    pub tcp_retry_backoff_cap: u32,
    pub tcp_client_cleanup_delay_ms: u32,
    pub tcp_client_deletion_spacing_ms: u32,
    pub tcp_exhaustion_reconnect_delay_ms: u32,
    pub tcp_failure_block_duration_ms: u32,

    /// Upper bound on whole frames queued per connection send buffer.
    pub send_queue_max_frames: usize,

    pub max_tracked_messages: usize,
    pub duplicate_tracking_timeout_ms: u32,

    pub gateway: GatewayConfig,
    pub queue: QueueConfig,
    pub health: HealthConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_sync_interval_ms: 60_000,
            node_sync_ap_stagger_ms: 10_000,
            node_timeout_ms: 120_000,
            time_sync_interval_ms: 600_000,
            time_sync_initial_delay_ms: 10_000,
            tcp_connect_max_retries: 5,
            tcp_connect_retry_delay_ms: 1_000,
            tcp_retry_backoff_cap: 8,
            tcp_client_cleanup_delay_ms: 1_000,
            tcp_client_deletion_spacing_ms: 250,
            tcp_exhaustion_reconnect_delay_ms: 10_000,
            tcp_failure_block_duration_ms: 60_000,
            send_queue_max_frames: 50,
            max_tracked_messages: 500,
            duplicate_tracking_timeout_ms: 60_000,
            gateway: GatewayConfig::default(),
            queue: QueueConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub bridge_status_interval_ms: u32,
    pub bridge_timeout_ms: u32,
    pub max_known_bridges: usize,
    /// Periodic purge of unhealthy bridge entries.
    pub cleanup_enabled: bool,
    pub internet_request_timeout_ms: u32,
    pub internet_retry_count: u8,
    pub internet_retry_delay_ms: u32,
    pub pending_sweep_interval_ms: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bridge_status_interval_ms: 30_000,
            bridge_timeout_ms: 60_000,
            max_known_bridges: 20,
            cleanup_enabled: true,
            internet_request_timeout_ms: 30_000,
            internet_retry_count: 3,
            internet_retry_delay_ms: 1_000,
            pending_sweep_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub max_retry_attempts: u8,
    /// NORMAL entries older than this are eviction candidates when a
    /// CRITICAL or HIGH enqueue needs room.
    pub normal_evict_age_ms: u32,
    /// JSON-lines persistence target; `None` disables persistence.
    pub persist_path: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 500,
            max_retry_attempts: 3,
            normal_evict_age_ms: 3_600_000,
            persist_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    pub host: String,
    pub port: u16,
    pub interval_ms: u32,
    pub timeout_ms: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { host: "8.8.8.8".into(), port: 53, interval_ms: 30_000, timeout_ms: 5_000 }
    }
}
