//! Local Internet health: a periodic TCP probe to a known host.
//!
//! The probe itself is a collaborator; on hosts without a real network
//! stack a mock result can be pinned for testing. Transitions of the
//! availability flag surface through the mesh event queue.

use crate::config::HealthConfig;

/// One-shot TCP reachability probe. `start` begins an async attempt;
/// `poll` yields the outcome exactly once when it completes.
pub trait InternetProbe: Send {
    fn start(&mut self, host: &str, port: u16, timeout_ms: u32);
    fn poll(&mut self) -> Option<Result<u32, String>>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InternetStatus {
    pub available: bool,
    pub checks_total: u32,
    pub successes_total: u32,
    pub last_latency_ms: Option<u32>,
    pub last_error: Option<String>,
    pub last_success_at: Option<u32>,
}

pub struct HealthChecker {
    config: HealthConfig,
    probe: Option<Box<dyn InternetProbe>>,
    status: InternetStatus,
    in_flight: bool,
    /// Pinned result for host-only test environments.
    mock_internet: Option<bool>,
}

impl HealthChecker {
    pub fn new(config: HealthConfig) -> Self {
        Self { config, probe: None, status: InternetStatus::default(), in_flight: false, mock_internet: None }
    }

    pub fn set_probe(&mut self, probe: Box<dyn InternetProbe>) {
        self.probe = Some(probe);
    }

    pub fn has_probe(&self) -> bool {
        self.probe.is_some() || self.mock_internet.is_some()
    }

    /// Pin (or clear) a mock outcome; while set, probes resolve instantly.
    pub fn set_mock_internet(&mut self, available: Option<bool>) {
        self.mock_internet = available;
    }

    pub fn interval_ms(&self) -> u32 {
        self.config.interval_ms
    }

    pub fn status(&self) -> &InternetStatus {
        &self.status
    }

    pub fn available(&self) -> bool {
        self.status.available
    }

    /// Kick off one probe. Returns an availability transition immediately
    /// in mock mode, `None` otherwise (the real result arrives via `poll`).
    pub fn start_check(&mut self, now: u32) -> Option<bool> {
        if let Some(mock) = self.mock_internet {
            let outcome = if mock { Ok(0) } else { Err("mock offline".to_string()) };
            return self.record(outcome, now);
        }
        let config = self.config.clone();
        if let Some(probe) = self.probe.as_mut() {
            if !self.in_flight {
                probe.start(&config.host, config.port, config.timeout_ms);
                self.in_flight = true;
            }
        }
        None
    }

    /// Collect a completed probe, if any. Returns the new availability on
    /// a transition.
    pub fn poll(&mut self, now: u32) -> Option<bool> {
        if !self.in_flight {
            return None;
        }
        let outcome = self.probe.as_mut()?.poll()?;
        self.in_flight = false;
        self.record(outcome, now)
    }

    fn record(&mut self, outcome: Result<u32, String>, now: u32) -> Option<bool> {
        self.status.checks_total += 1;
        let available = match outcome {
            Ok(latency_ms) => {
                self.status.successes_total += 1;
                self.status.last_latency_ms = Some(latency_ms);
                self.status.last_success_at = Some(now);
                self.status.last_error = None;
                true
            }
            Err(reason) => {
                log::debug!("health: probe failed: {reason}");
                self.status.last_error = Some(reason);
                false
            }
        };
        if available != self.status.available {
            self.status.available = available;
            log::info!("health: local internet {}", if available { "up" } else { "down" });
            return Some(available);
        }
        None
    }
}
