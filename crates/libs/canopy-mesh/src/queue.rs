//! Bounded offline message queue with priority-aware eviction and optional
//! JSON-lines persistence.
//!
//! Messages wait here while no Internet path exists. CRITICAL entries are
//! never evicted; a CRITICAL or HIGH arrival at capacity makes room by
//! dropping the first LOW entry, then the first sufficiently old NORMAL
//! entry, and otherwise is refused.

use std::collections::VecDeque;
use std::fs;
use std::io::Write as _;
use std::path::Path;

use canopy_proto::Priority;
use serde::{Deserialize, Serialize};

use crate::clock::elapsed_ms;
use crate::config::QueueConfig;
use crate::error::MeshError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub id: u64,
    pub priority: Priority,
    pub enqueued_at: u32,
    pub attempts: u8,
    pub payload: String,
    pub destination: String,
}

/// Fill-level buckets reported on every size transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillLevel {
    Empty,
    Quarter,
    Half,
    ThreeQuarters,
    Full,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued_total: u64,
    pub dropped_total: u64,
    pub evicted_total: u64,
    pub sent_total: u64,
    pub failed_total: u64,
    pub pruned_total: u64,
    pub peak_size: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub failed: usize,
    pub kept: usize,
}

/// On-disk form, one self-describing object per line.
#[derive(Serialize, Deserialize)]
struct PersistedMessage {
    id: u64,
    priority: u8,
    timestamp: u32,
    attempts: u8,
    payload: String,
    destination: String,
}

type LevelCallback = Box<dyn FnMut(FillLevel, usize) + Send>;

pub struct OfflineQueue {
    entries: VecDeque<QueuedMessage>,
    config: QueueConfig,
    next_id: u64,
    stats: QueueStats,
    level: FillLevel,
    level_callbacks: Vec<LevelCallback>,
}

impl OfflineQueue {
    pub fn new(config: QueueConfig) -> Self {
        let mut queue = Self {
            entries: VecDeque::new(),
            config,
            next_id: 1,
            stats: QueueStats::default(),
            level: FillLevel::Empty,
            level_callbacks: Vec::new(),
        };
        if let Some(path) = queue.config.persist_path.clone() {
            queue.load(&path);
        }
        queue
    }

    /// Queue a message. CRITICAL/HIGH arrivals may evict to make room;
    /// NORMAL/LOW arrivals are refused when full.
    pub fn enqueue(
        &mut self,
        payload: &str,
        destination: &str,
        priority: Priority,
        now: u32,
    ) -> Result<u64, MeshError> {
        if self.entries.len() >= self.config.max_queue_size {
            let may_evict = matches!(priority, Priority::Critical | Priority::High);
            if !may_evict || !self.evict_one(now) {
                self.stats.dropped_total += 1;
                log::debug!("queue: full, dropping {:?} message", priority);
                return Err(MeshError::QueueFull);
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(QueuedMessage {
            id,
            priority,
            enqueued_at: now,
            attempts: 0,
            payload: payload.to_string(),
            destination: destination.to_string(),
        });
        self.stats.enqueued_total += 1;
        self.stats.peak_size = self.stats.peak_size.max(self.entries.len());

        if priority == Priority::Critical {
            self.persist();
        }
        self.notify_level();
        Ok(id)
    }

    /// Attempt delivery of every queued entry in order. Failures are kept
    /// until the retry cap, then counted as failed and removed.
    pub fn flush<F: FnMut(&str, &str) -> bool>(&mut self, mut send: F) -> FlushReport {
        let mut report = FlushReport::default();
        let mut kept = VecDeque::new();

        for mut message in std::mem::take(&mut self.entries) {
            message.attempts += 1;
            if send(&message.payload, &message.destination) {
                report.sent += 1;
                self.stats.sent_total += 1;
            } else if message.attempts >= self.config.max_retry_attempts {
                report.failed += 1;
                self.stats.failed_total += 1;
                log::debug!("queue: giving up on message {} after {} attempts", message.id, message.attempts);
            } else {
                kept.push_back(message);
            }
        }

        report.kept = kept.len();
        self.entries = kept;
        if report.sent > 0 || report.failed > 0 {
            self.persist();
        }
        self.notify_level();
        report
    }

    /// Drop every entry older than the given age.
    pub fn prune(&mut self, max_age_hours: u32, now: u32) -> usize {
        let max_age_ms = max_age_hours.saturating_mul(3_600_000);
        let before = self.entries.len();
        self.entries.retain(|message| elapsed_ms(now, message.enqueued_at) <= max_age_ms);
        let pruned = before - self.entries.len();
        if pruned > 0 {
            self.stats.pruned_total += pruned as u64;
            self.persist();
            self.notify_level();
        }
        pruned
    }

    pub fn on_level_change(&mut self, callback: LevelCallback) {
        self.level_callbacks.push(callback);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    pub fn level(&self) -> FillLevel {
        self.level
    }

    /// Snapshot of the queued messages, front first.
    pub fn messages(&self) -> Vec<QueuedMessage> {
        self.entries.iter().cloned().collect()
    }

    /// First LOW entry; else first NORMAL entry older than the configured
    /// age; CRITICAL entries are untouchable.
    fn evict_one(&mut self, now: u32) -> bool {
        if let Some(idx) = self.entries.iter().position(|m| m.priority == Priority::Low) {
            let evicted = self.entries.remove(idx);
            self.stats.evicted_total += 1;
            log::debug!("queue: evicted LOW message {:?}", evicted.map(|m| m.id));
            return true;
        }
        let age_limit = self.config.normal_evict_age_ms;
        if let Some(idx) = self.entries.iter().position(|m| {
            m.priority == Priority::Normal && elapsed_ms(now, m.enqueued_at) > age_limit
        }) {
            let evicted = self.entries.remove(idx);
            self.stats.evicted_total += 1;
            log::debug!("queue: evicted aged NORMAL message {:?}", evicted.map(|m| m.id));
            return true;
        }
        false
    }

    fn notify_level(&mut self) {
        let new_level = self.fill_level();
        if new_level != self.level {
            self.level = new_level;
            let size = self.entries.len();
            for callback in &mut self.level_callbacks {
                callback(new_level, size);
            }
        }
    }

    fn fill_level(&self) -> FillLevel {
        let capacity = self.config.max_queue_size.max(1);
        let len = self.entries.len();
        if len >= capacity {
            FillLevel::Full
        } else if len * 4 >= capacity * 3 {
            FillLevel::ThreeQuarters
        } else if len * 2 >= capacity {
            FillLevel::Half
        } else if len * 4 >= capacity {
            FillLevel::Quarter
        } else {
            FillLevel::Empty
        }
    }

    fn persist(&self) {
        let Some(path) = self.config.persist_path.as_deref() else {
            return;
        };
        if let Err(err) = self.write_lines(path) {
            log::warn!("queue: persistence write failed: {err}");
        }
    }

    fn write_lines(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            for message in &self.entries {
                let record = PersistedMessage {
                    id: message.id,
                    priority: message.priority.level(),
                    timestamp: message.enqueued_at,
                    attempts: message.attempts,
                    payload: message.payload.clone(),
                    destination: message.destination.clone(),
                };
                let line = serde_json::to_string(&record)
                    .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }
        }
        fs::rename(&tmp, path)
    }

    /// Reload persisted entries, skipping lines that fail to parse, and
    /// resume the id counter past the largest loaded id.
    fn load(&mut self, path: &Path) {
        let Ok(raw) = fs::read_to_string(path) else {
            return;
        };
        let mut max_id = 0u64;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(record) = serde_json::from_str::<PersistedMessage>(line) else {
                log::warn!("queue: skipping unreadable persisted entry");
                continue;
            };
            max_id = max_id.max(record.id);
            self.entries.push_back(QueuedMessage {
                id: record.id,
                priority: Priority::from_level(record.priority),
                enqueued_at: record.timestamp,
                attempts: record.attempts,
                payload: record.payload,
                destination: record.destination,
            });
        }
        self.next_id = max_id + 1;
        self.stats.peak_size = self.entries.len();
        self.level = self.fill_level();
        log::info!("queue: restored {} persisted message(s)", self.entries.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn config(capacity: usize) -> QueueConfig {
        QueueConfig { max_queue_size: capacity, ..QueueConfig::default() }
    }

    #[test]
    fn high_arrival_evicts_low_first() {
        let mut queue = OfflineQueue::new(config(3));
        queue.enqueue("a", "x", Priority::Critical, 0).expect("enqueue");
        queue.enqueue("b", "x", Priority::Normal, 0).expect("enqueue");
        queue.enqueue("c", "x", Priority::Low, 0).expect("enqueue");

        queue.enqueue("d", "x", Priority::High, 1).expect("eviction makes room");
        let priorities: Vec<Priority> = queue.messages().iter().map(|m| m.priority).collect();
        assert_eq!(priorities, vec![Priority::Critical, Priority::Normal, Priority::High]);
        assert_eq!(queue.stats().dropped_total, 0);

        // Full again and LOW cannot evict anything.
        assert!(queue.enqueue("e", "x", Priority::Low, 2).is_err());
        assert_eq!(queue.stats().dropped_total, 1);
    }

    #[test]
    fn normal_eviction_requires_age() {
        let mut queue = OfflineQueue::new(config(2));
        queue.enqueue("a", "x", Priority::Normal, 0).expect("enqueue");
        queue.enqueue("b", "x", Priority::Normal, 0).expect("enqueue");

        // Fresh NORMAL entries are not evictable.
        assert!(queue.enqueue("c", "x", Priority::Critical, 1_000).is_err());

        // One hour later the oldest NORMAL can go.
        queue.enqueue("c", "x", Priority::Critical, 3_600_001).expect("aged eviction");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn critical_entries_are_never_evicted() {
        let mut queue = OfflineQueue::new(config(2));
        queue.enqueue("a", "x", Priority::Critical, 0).expect("enqueue");
        queue.enqueue("b", "x", Priority::Critical, 0).expect("enqueue");
        assert!(queue.enqueue("c", "x", Priority::Critical, 10_000_000).is_err());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn flush_removes_sent_and_exhausted() {
        let mut queue = OfflineQueue::new(QueueConfig {
            max_queue_size: 10,
            max_retry_attempts: 2,
            ..QueueConfig::default()
        });
        queue.enqueue("ok", "x", Priority::Normal, 0).expect("enqueue");
        queue.enqueue("bad", "x", Priority::Normal, 0).expect("enqueue");

        let report = queue.flush(|payload, _| payload == "ok");
        assert_eq!((report.sent, report.failed, report.kept), (1, 0, 1));

        // Second failure hits the retry cap.
        let report = queue.flush(|_, _| false);
        assert_eq!((report.sent, report.failed, report.kept), (0, 1, 0));
        assert!(queue.is_empty());
    }

    #[test]
    fn prune_drops_aged_entries() {
        let mut queue = OfflineQueue::new(config(10));
        queue.enqueue("old", "x", Priority::Normal, 0).expect("enqueue");
        queue.enqueue("new", "x", Priority::Normal, 3_600_000).expect("enqueue");
        assert_eq!(queue.prune(1, 3_700_000), 1);
        assert_eq!(queue.messages()[0].payload, "new");
    }

    #[test]
    fn level_transitions_fire_once_per_bucket() {
        let mut queue = OfflineQueue::new(config(4));
        let seen: Arc<Mutex<Vec<(FillLevel, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        queue.on_level_change(Box::new(move |level, size| {
            sink.lock().expect("sink").push((level, size));
        }));

        for n in 0..4 {
            queue.enqueue("m", "x", Priority::Normal, n).expect("enqueue");
        }
        let transitions = seen.lock().expect("seen").clone();
        assert_eq!(
            transitions,
            vec![
                (FillLevel::Quarter, 1),
                (FillLevel::Half, 2),
                (FillLevel::ThreeQuarters, 3),
                (FillLevel::Full, 4),
            ]
        );
    }

    #[test]
    fn persistence_roundtrip_resumes_id_counter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("queue.jsonl");

        let mut queue = OfflineQueue::new(QueueConfig {
            max_queue_size: 10,
            persist_path: Some(path.clone()),
            ..QueueConfig::default()
        });
        let first = queue.enqueue("a", "http://x", Priority::Critical, 5).expect("enqueue");
        let second = queue.enqueue("b", "http://y", Priority::Critical, 6).expect("enqueue");
        drop(queue);

        let mut restored = OfflineQueue::new(QueueConfig {
            max_queue_size: 10,
            persist_path: Some(path),
            ..QueueConfig::default()
        });
        assert_eq!(restored.len(), 2);
        let next = restored.enqueue("c", "http://z", Priority::Critical, 7).expect("enqueue");
        assert!(next > second);
        assert!(second > first);
    }

    #[test]
    fn unreadable_lines_are_skipped_on_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("queue.jsonl");
        fs::write(
            &path,
            "{\"id\":3,\"priority\":0,\"timestamp\":1,\"attempts\":0,\"payload\":\"p\",\"destination\":\"d\"}\nnot json\n",
        )
        .expect("write");

        let queue = OfflineQueue::new(QueueConfig {
            max_queue_size: 10,
            persist_path: Some(path),
            ..QueueConfig::default()
        });
        assert_eq!(queue.len(), 1);
    }
}
