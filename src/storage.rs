//! Local metric storage.
//!
//! The sync engine only needs to read unsynced records, mark them synced and
//! ask for usage figures. Producers add records through the same trait.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::trace;

use crate::model::Metric;

/// Fixed per-record overhead used for byte accounting.
const RECORD_OVERHEAD_BYTES: i64 = 48;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage is closed")]
    Closed,

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Usage figures reported by a storage backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageInfo {
    pub total_metrics: i64,
    pub unsynced_metrics: i64,
    pub storage_bytes: i64,
    pub oldest_metric: Option<DateTime<Utc>>,
    pub newest_metric: Option<DateTime<Utc>>,
}

/// Durable (or not) home for metrics awaiting sync.
///
/// Implementations provide their own internal synchronization.
pub trait Storage: Send + Sync {
    fn store_metric(&self, metric: Metric) -> Result<(), StorageError>;

    fn store_batch(&self, metrics: Vec<Metric>) -> Result<(), StorageError> {
        for metric in metrics {
            self.store_metric(metric)?;
        }
        Ok(())
    }

    /// Oldest unsynced records first, at most `limit`.
    fn get_unsynced(&self, limit: usize) -> Result<Vec<Metric>, StorageError>;

    /// Drop the given ids from the unsynced set. Unknown ids are ignored.
    fn mark_synced(&self, ids: &[i64]) -> Result<(), StorageError>;

    fn storage_info(&self) -> StorageInfo;
}

struct Ring {
    metrics: VecDeque<Metric>,
    next_id: i64,
    bytes: i64,
    dropped: u64,
    closed: bool,
}

/// Bounded in-memory ring for devices without persistent storage.
///
/// When full, the oldest record is evicted to make room.
pub struct MemoryStorage {
    max_size: usize,
    ring: RwLock<Ring>,
}

impl MemoryStorage {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            max_size,
            ring: RwLock::new(Ring {
                metrics: VecDeque::with_capacity(max_size.min(4096)),
                next_id: 1,
                bytes: 0,
                dropped: 0,
                closed: false,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.ring.read().metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.read().metrics.is_empty()
    }

    /// Records evicted because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.ring.read().dropped
    }

    pub fn close(&self) {
        self.ring.write().closed = true;
    }
}

fn estimated_size(metric: &Metric) -> i64 {
    let labels: usize = metric.labels.iter().map(|(k, v)| k.len() + v.len()).sum();
    RECORD_OVERHEAD_BYTES + (metric.name.len() + labels) as i64
}

impl Storage for MemoryStorage {
    fn store_metric(&self, mut metric: Metric) -> Result<(), StorageError> {
        let mut ring = self.ring.write();
        if ring.closed {
            return Err(StorageError::Closed);
        }

        if metric.id == 0 {
            metric.id = ring.next_id;
        }
        ring.next_id = ring.next_id.max(metric.id) + 1;
        ring.bytes += estimated_size(&metric);
        ring.metrics.push_back(metric);

        while ring.metrics.len() > self.max_size {
            if let Some(evicted) = ring.metrics.pop_front() {
                ring.bytes -= estimated_size(&evicted);
                ring.dropped += 1;
                trace!(id = evicted.id, "Evicted oldest metric from memory storage");
            }
        }
        Ok(())
    }

    fn get_unsynced(&self, limit: usize) -> Result<Vec<Metric>, StorageError> {
        let ring = self.ring.read();
        if ring.closed {
            return Err(StorageError::Closed);
        }
        Ok(ring.metrics.iter().take(limit).cloned().collect())
    }

    fn mark_synced(&self, ids: &[i64]) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: HashSet<i64> = ids.iter().copied().collect();

        let mut ring = self.ring.write();
        if ring.closed {
            return Err(StorageError::Closed);
        }

        let mut freed = 0;
        ring.metrics.retain(|m| {
            if ids.contains(&m.id) {
                freed += estimated_size(m);
                false
            } else {
                true
            }
        });
        ring.bytes -= freed;
        Ok(())
    }

    fn storage_info(&self) -> StorageInfo {
        let ring = self.ring.read();
        let count = ring.metrics.len() as i64;
        StorageInfo {
            total_metrics: count,
            unsynced_metrics: count,
            storage_bytes: ring.bytes,
            oldest_metric: ring.metrics.front().map(|m| m.timestamp),
            newest_metric: ring.metrics.back().map(|m| m.timestamp),
        }
    }
}
