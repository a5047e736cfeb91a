//! Sync orchestration.
//!
//! The [`SyncManager`] owns the live [`SyncConfig`] and runs two workers: the
//! sync worker, which wakes on its interval tick, an explicit trigger or stop,
//! and the monitor worker, which periodically checks sync health and requests
//! cycles through the same coalescing trigger. At most one cycle runs at a
//! time; a cycle that finds another in flight returns immediately.
//!
//! Records are marked synced only after the server acknowledges them, so a
//! failed or interrupted cycle resends the same records later.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::backoff::Backoff;
use crate::buffer::{BatchBuffer, BufferConfig, BufferError};
use crate::capability::{DeviceCapability, Tier};
use crate::circuit_breaker::{CircuitBreaker, CircuitError, CircuitState};
use crate::client::{ClientError, SyncClient};
use crate::compression::{compressor_for, encode_batch, CompressionError, CompressionType};
use crate::config::SyncConfig;
use crate::model::{
    GetSyncConfigRequest, LogEntry, SyncConfigUpdate, SyncLogsRequest, SyncMetadata, SyncMetricsRequest,
    SyncMetricsResponse,
};
use crate::rate_limit::RateLimiter;
use crate::storage::{Storage, StorageError};

/// How long log entries wait in the buffer before moving to the offline queue.
const LOG_BUFFER_MAX_WAIT: Duration = Duration::from_secs(5);

/// Burst allowance of the outbound byte budget, in seconds of traffic.
const BANDWIDTH_BURST_SECS: f64 = 1.0;

/// Errors that fail a sync cycle or a manager operation.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to encode batch: {0}")]
    Compression(#[from] CompressionError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("server rejected sync: {0}")]
    Rejected(String),

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("sync call timed out after {0:?}")]
    Timeout(Duration),

    #[error("log buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("sync manager already started")]
    AlreadyStarted,

    #[error("sync manager is stopped")]
    Stopped,
}

/// Result of a single [`SyncManager::perform_sync`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another cycle was in flight; nothing was done
    AlreadySyncing,
    /// Nothing to send
    Idle,
    Synced { metrics: usize, bytes_sent: usize },
}

/// Why the health monitor requested a sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthTrigger {
    Backlog { unsynced: i64, threshold: i64 },
    StorageNearlyFull { used: u64, limit: u64 },
    Overdue { since_last_success: Duration },
}

/// Running counters. Each field is independently atomic.
#[derive(Debug, Default)]
struct SyncMetrics {
    metrics_synced: AtomicU64,
    logs_synced: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_before_compression: AtomicU64,
    last_sync_duration_us: AtomicU64,
    successful_syncs: AtomicU64,
    failed_syncs: AtomicU64,
    consecutive_failures: AtomicU32,
    /// Wall-clock millis of the last completed cycle, 0 if none
    last_sync_at_ms: AtomicI64,
    last_error: Mutex<Option<String>>,
}

/// Point-in-time copy of the sync counters.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMetricsSnapshot {
    pub metrics_synced: u64,
    pub logs_synced: u64,
    pub bytes_sent: u64,
    pub bytes_before_compression: u64,
    pub last_sync_duration: Duration,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Bytes sent over bytes before compression; 1.0 before any traffic
    pub compression_ratio: f64,
    pub logs_queued: usize,
    pub logs_dropped: u64,
    pub circuit_state: CircuitState,
}

/// Bounded FIFO of log entries awaiting sync. Oldest entries are dropped
/// when full.
#[derive(Debug)]
struct LogQueue {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl LogQueue {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    fn push_back(&self, batch: Vec<LogEntry>) {
        let mut entries = self.entries.lock();
        entries.extend(batch);
        self.trim(&mut entries);
    }

    /// Return entries that failed to send, ahead of anything newer.
    fn push_front(&self, batch: Vec<LogEntry>) {
        let mut entries = self.entries.lock();
        for entry in batch.into_iter().rev() {
            entries.push_front(entry);
        }
        self.trim(&mut entries);
    }

    fn take(&self, limit: usize) -> Vec<LogEntry> {
        let mut entries = self.entries.lock();
        let n = limit.min(entries.len());
        entries.drain(..n).collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn trim(&self, entries: &mut VecDeque<LogEntry>) {
        let excess = entries.len().saturating_sub(self.capacity);
        if excess > 0 {
            entries.drain(..excess);
            self.dropped.fetch_add(excess as u64, Ordering::Relaxed);
            warn!(dropped = excess, capacity = self.capacity, "Offline log queue full, dropped oldest entries");
        }
    }
}

/// Releases the single-writer flag on drop.
struct SyncGuard<'a>(&'a AtomicBool);

impl<'a> SyncGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncGuard(flag))
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    storage: Arc<dyn Storage>,
    client: Arc<dyn SyncClient>,
    capability: DeviceCapability,
    config: RwLock<SyncConfig>,
    metrics: SyncMetrics,

    sequence: AtomicI64,
    syncing: AtomicBool,
    stopping: AtomicBool,

    trigger_tx: mpsc::Sender<()>,
    trigger_rx: Mutex<Option<mpsc::Receiver<()>>>,
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,

    backoff: Backoff,
    breaker: CircuitBreaker,
    limiter: Option<RateLimiter>,

    log_buffer: BatchBuffer<LogEntry>,
    log_queue: Arc<LogQueue>,

    /// Reference point for `last_success_ms`
    epoch: Instant,
    last_success_ms: AtomicU64,
}

/// Orchestrates sync cycles for one device. Cheap to clone.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

impl SyncManager {
    /// Build a manager. Unset cadence, batch size and codec in `config` are
    /// filled from the capability tier.
    pub fn new(
        storage: Arc<dyn Storage>,
        client: Arc<dyn SyncClient>,
        capability: DeviceCapability,
        mut config: SyncConfig,
    ) -> Self {
        config.apply_capability_defaults(&capability);

        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (stop_tx, _) = watch::channel(false);

        let backoff = Backoff::new(config.initial_backoff, config.max_backoff, config.backoff_multiplier);
        let breaker = CircuitBreaker::new(config.circuit_failure_threshold, config.circuit_reset_timeout);
        let limiter = bandwidth_budget(&config, &capability)
            .map(|rate| RateLimiter::new(rate, rate * BANDWIDTH_BURST_SECS));

        let log_queue = Arc::new(LogQueue::new(config.offline_queue_size));
        let sink = log_queue.clone();
        let log_buffer = BatchBuffer::new(
            BufferConfig::new(config.batch_size, LOG_BUFFER_MAX_WAIT),
            move |entries| {
                sink.push_back(entries);
                Ok(())
            },
        );

        let sequence_seed = Utc::now().timestamp_nanos_opt().unwrap_or_default();

        Self {
            inner: Arc::new(Inner {
                storage,
                client,
                capability,
                config: RwLock::new(config),
                metrics: SyncMetrics::default(),
                sequence: AtomicI64::new(sequence_seed),
                syncing: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                trigger_tx,
                trigger_rx: Mutex::new(Some(trigger_rx)),
                stop_tx,
                workers: Mutex::new(Vec::new()),
                backoff,
                breaker,
                limiter,
                log_buffer,
                log_queue,
                epoch: Instant::now(),
                last_success_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Launch the sync and monitor workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), SyncError> {
        if self.inner.stopping.load(Ordering::Acquire) {
            return Err(SyncError::Stopped);
        }
        let trigger_rx = self.inner.trigger_rx.lock().take().ok_or(SyncError::AlreadyStarted)?;

        {
            let config = self.inner.config.read();
            info!(
                device_id = %config.device_id,
                tier = %self.inner.capability.tier,
                interval_secs = config.sync_interval.as_secs(),
                batch_size = config.batch_size,
                compression = %config.effective_compression(),
                "Starting sync manager"
            );
        }

        let sync_worker = tokio::spawn(self.clone().sync_worker(trigger_rx, self.inner.stop_tx.subscribe()));
        let monitor_worker = tokio::spawn(self.clone().monitor_worker(self.inner.stop_tx.subscribe()));
        self.inner.workers.lock().extend([sync_worker, monitor_worker]);
        Ok(())
    }

    /// Stop both workers, then make one best-effort final sync. Both steps
    /// share a single `shutdown_timeout` deadline.
    ///
    /// Errors are logged, never returned. Calling `stop` twice is a no-op,
    /// and a stopped manager cannot be started.
    pub async fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Stopping sync manager");

        let timeout = self.inner.config.read().shutdown_timeout;
        let deadline = Instant::now() + timeout;
        self.inner.trigger_rx.lock().take();
        let _ = self.inner.stop_tx.send(true);

        let mut workers = std::mem::take(&mut *self.inner.workers.lock());
        let joined = tokio::time::timeout_at(deadline, futures::future::join_all(workers.iter_mut())).await;
        if joined.is_err() {
            warn!(timeout_secs = timeout.as_secs(), "Sync workers did not stop in time, aborting");
            for worker in &workers {
                worker.abort();
            }
        }

        if let Err(e) = self.inner.log_buffer.flush() {
            warn!(error = %e, "Failed to flush log buffer before shutdown");
        }

        info!("Performing final sync before shutdown");
        match tokio::time::timeout_at(deadline, self.sync_now()).await {
            Ok(Ok(outcome)) => info!(?outcome, "Sync manager stopped"),
            Ok(Err(e)) => error!(error = %e, "Final sync failed"),
            Err(_) => warn!(timeout_secs = timeout.as_secs(), "Final sync timed out"),
        }
    }

    /// Request a sync cycle. A no-op if one is already pending.
    pub fn trigger_sync(&self) {
        match self.inner.trigger_tx.try_send(()) {
            Ok(()) => debug!("Sync triggered"),
            Err(_) => trace!("Sync already pending"),
        }
    }

    /// Run one cycle and apply the success/failure bookkeeping, including
    /// scheduling a backoff retrigger on failure.
    pub async fn sync_now(&self) -> Result<SyncOutcome, SyncError> {
        let result = self.perform_sync().await;
        match &result {
            Ok(SyncOutcome::AlreadySyncing) => {}
            Ok(outcome) => self.on_success(outcome),
            Err(e) => self.on_failure(e),
        }
        result
    }

    /// Run one sync cycle without failure bookkeeping.
    pub async fn perform_sync(&self) -> Result<SyncOutcome, SyncError> {
        let Some(_guard) = SyncGuard::acquire(&self.inner.syncing) else {
            debug!("Sync already in progress");
            return Ok(SyncOutcome::AlreadySyncing);
        };

        let start = Instant::now();
        let result = self.sync_cycle().await;

        let metrics = &self.inner.metrics;
        metrics
            .last_sync_duration_us
            .store(start.elapsed().as_micros() as u64, Ordering::Relaxed);
        metrics
            .last_sync_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

        result
    }

    async fn sync_cycle(&self) -> Result<SyncOutcome, SyncError> {
        trace!("Starting sync cycle");

        let info = self.inner.storage.storage_info();
        if info.unsynced_metrics == 0 {
            debug!("No unsynced data");
            return Ok(SyncOutcome::Idle);
        }

        let (batch_size, codec) = {
            let config = self.inner.config.read();
            (config.batch_size, config.effective_compression())
        };

        let metrics = self.inner.storage.get_unsynced(batch_size)?;
        if metrics.is_empty() {
            return Ok(SyncOutcome::Idle);
        }
        let ids: Vec<i64> = metrics.iter().map(|m| m.id).collect();
        let count = metrics.len();

        let encoded = encode_batch(metrics, Some(compressor_for(codec).as_ref()))?;
        trace!(
            records = count,
            codec = %encoded.batch.codec(),
            original_size = encoded.original_size,
            wire_size = encoded.wire_size,
            "Batch encoded"
        );

        if let Some(limiter) = &self.inner.limiter {
            limiter.wait((encoded.wire_size as f64).min(limiter.capacity())).await;
        }

        let (original_size, wire_size) = (encoded.original_size, encoded.wire_size);
        let request = SyncMetricsRequest {
            metadata: self.metadata(),
            batch: encoded.batch,
        };
        let response = self.send_metrics(&request).await?;

        if let Err(e) = self.inner.storage.mark_synced(&ids) {
            warn!(error = %e, records = count, "Failed to mark metrics as synced");
        }

        let counters = &self.inner.metrics;
        counters.metrics_synced.fetch_add(count as u64, Ordering::Relaxed);
        counters.bytes_sent.fetch_add(wire_size as u64, Ordering::Relaxed);
        counters
            .bytes_before_compression
            .fetch_add(original_size as u64, Ordering::Relaxed);

        if let Some(update) = response.config_update.as_ref().filter(|u| !u.is_empty()) {
            self.apply_config_update(update);
        }

        if self.inner.capability.tier == Tier::Full {
            if let Err(e) = self.sync_logs().await {
                warn!(error = %e, "Failed to sync logs");
            }
        }

        debug!(records = count, bytes_sent = wire_size, "Sync cycle completed");
        Ok(SyncOutcome::Synced {
            metrics: count,
            bytes_sent: wire_size,
        })
    }

    /// Send a metrics batch through the circuit breaker, under the call deadline.
    /// A `success=false` answer counts as a failure.
    async fn send_metrics(&self, request: &SyncMetricsRequest) -> Result<SyncMetricsResponse, SyncError> {
        let timeout = self.inner.config.read().call_timeout;
        let client = &self.inner.client;

        self.inner
            .breaker
            .call(|| async move {
                match tokio::time::timeout(timeout, client.sync_metrics(request)).await {
                    Err(_) => Err(SyncError::Timeout(timeout)),
                    Ok(Err(e)) => Err(SyncError::Client(e)),
                    Ok(Ok(response)) if !response.success => Err(SyncError::Rejected(response.error_message)),
                    Ok(Ok(response)) => Ok(response),
                }
            })
            .await
            .map_err(|e| match e {
                CircuitError::Open => SyncError::CircuitOpen,
                CircuitError::Inner(e) => e,
            })
    }

    /// Drain up to one batch of queued logs to the server. Entries that fail
    /// to send go back to the front of the queue.
    async fn sync_logs(&self) -> Result<usize, SyncError> {
        if let Err(e) = self.inner.log_buffer.flush() {
            warn!(error = %e, "Failed to flush log buffer");
        }

        let (batch_size, timeout) = {
            let config = self.inner.config.read();
            (config.batch_size, config.call_timeout)
        };
        let logs = self.inner.log_queue.take(batch_size);
        if logs.is_empty() {
            return Ok(0);
        }

        let count = logs.len();
        let request = SyncLogsRequest {
            metadata: self.metadata(),
            logs,
        };

        let result = match tokio::time::timeout(timeout, self.inner.client.sync_logs(&request)).await {
            Err(_) => Err(SyncError::Timeout(timeout)),
            Ok(Err(e)) => Err(SyncError::Client(e)),
            Ok(Ok(response)) if !response.success => Err(SyncError::Rejected(response.error_message)),
            Ok(Ok(_)) => Ok(count),
        };

        match result {
            Ok(count) => {
                self.inner.metrics.logs_synced.fetch_add(count as u64, Ordering::Relaxed);
                debug!(logs = count, "Logs synced");
                Ok(count)
            }
            Err(e) => {
                self.inner.log_queue.push_front(request.logs);
                Err(e)
            }
        }
    }

    fn on_success(&self, outcome: &SyncOutcome) {
        let metrics = &self.inner.metrics;
        if matches!(outcome, SyncOutcome::Synced { .. }) {
            metrics.successful_syncs.fetch_add(1, Ordering::Relaxed);
        }
        metrics.consecutive_failures.store(0, Ordering::Relaxed);
        self.inner.backoff.reset();
        self.inner
            .last_success_ms
            .store(self.inner.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn on_failure(&self, error: &SyncError) {
        let metrics = &self.inner.metrics;
        metrics.failed_syncs.fetch_add(1, Ordering::Relaxed);
        let consecutive = metrics.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        *metrics.last_error.lock() = Some(error.to_string());

        error!(error = %error, consecutive_failures = consecutive, "Sync failed");

        if self.inner.stopping.load(Ordering::Acquire) {
            return;
        }

        let delay = self.inner.backoff.next();
        info!(
            retry_in_ms = delay.as_millis() as u64,
            attempt = self.inner.backoff.attempt(),
            "Will retry sync"
        );

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                if !inner.stopping.load(Ordering::Acquire) {
                    SyncManager { inner }.trigger_sync();
                }
            }
        });
    }

    /// Evaluate backlog, storage pressure and staleness, triggering a sync on
    /// the first condition that holds.
    pub fn check_sync_health(&self) -> Option<HealthTrigger> {
        let info = self.inner.storage.storage_info();
        let (batch_size, interval) = {
            let config = self.inner.config.read();
            (config.batch_size, config.sync_interval)
        };
        let capability = &self.inner.capability;

        let backlog_threshold = (batch_size as i64).saturating_mul(2);
        let storage_limit = capability.local_storage_size.saturating_mul(8) / 10;
        let storage_used = info.storage_bytes.max(0) as u64;
        let since_last_success = self
            .inner
            .epoch
            .elapsed()
            .saturating_sub(Duration::from_millis(self.inner.last_success_ms.load(Ordering::Relaxed)));

        let trigger = if info.unsynced_metrics > backlog_threshold {
            info!(unsynced = info.unsynced_metrics, "Large buffer detected, triggering sync");
            HealthTrigger::Backlog {
                unsynced: info.unsynced_metrics,
                threshold: backlog_threshold,
            }
        } else if capability.has_sqlite && storage_used > storage_limit {
            warn!(
                used = storage_used,
                limit = capability.local_storage_size,
                "Storage nearly full, triggering sync"
            );
            HealthTrigger::StorageNearlyFull {
                used: storage_used,
                limit: capability.local_storage_size,
            }
        } else if since_last_success > interval.saturating_mul(3) {
            warn!(
                since_last_success_secs = since_last_success.as_secs(),
                "Sync overdue, triggering"
            );
            HealthTrigger::Overdue { since_last_success }
        } else {
            return None;
        };

        self.trigger_sync();
        Some(trigger)
    }

    /// Apply a server-pushed delta. Zero or empty fields leave the current
    /// value; an unsupported codec name is ignored.
    pub fn apply_config_update(&self, update: &SyncConfigUpdate) {
        let mut config = self.inner.config.write();

        if update.batch_size > 0 {
            config.batch_size = update.batch_size as usize;
        }
        if update.sync_interval_seconds > 0 {
            config.sync_interval = Duration::from_secs(u64::from(update.sync_interval_seconds));
        }
        if !update.compression_type.is_empty() {
            match update.compression_type.parse::<CompressionType>() {
                Ok(codec) => {
                    config.compression_type = Some(codec);
                    config.compression_enabled = update.compression_enabled;
                }
                Err(e) => warn!(
                    compression_type = %update.compression_type,
                    error = %e,
                    "Ignoring unsupported compression type from server"
                ),
            }
        }

        info!(
            batch_size = config.batch_size,
            interval_secs = config.sync_interval.as_secs(),
            compression = %config.effective_compression(),
            "Applied config update from server"
        );
    }

    /// Fetch the server's configuration for this device and apply it.
    pub async fn refresh_config(&self) -> Result<(), SyncError> {
        let (request, timeout) = {
            let config = self.inner.config.read();
            let request = GetSyncConfigRequest {
                device_id: config.device_id.clone(),
                org_id: config.org_id.clone(),
                capability: self.inner.capability.clone(),
            };
            (request, config.call_timeout)
        };

        let response = tokio::time::timeout(timeout, self.inner.client.get_sync_config(&request))
            .await
            .map_err(|_| SyncError::Timeout(timeout))??;

        if !response.config.is_empty() {
            self.apply_config_update(&response.config);
        }
        Ok(())
    }

    /// Queue a log entry for the next log sync.
    pub fn record_log(&self, entry: LogEntry) -> Result<(), SyncError> {
        self.inner.log_buffer.add(entry)?;
        Ok(())
    }

    pub fn get_metrics(&self) -> SyncMetricsSnapshot {
        let m = &self.inner.metrics;
        let bytes_sent = m.bytes_sent.load(Ordering::Relaxed);
        let bytes_before = m.bytes_before_compression.load(Ordering::Relaxed);
        let last_sync_at = m.last_sync_at_ms.load(Ordering::Relaxed);

        SyncMetricsSnapshot {
            metrics_synced: m.metrics_synced.load(Ordering::Relaxed),
            logs_synced: m.logs_synced.load(Ordering::Relaxed),
            bytes_sent,
            bytes_before_compression: bytes_before,
            last_sync_duration: Duration::from_micros(m.last_sync_duration_us.load(Ordering::Relaxed)),
            successful_syncs: m.successful_syncs.load(Ordering::Relaxed),
            failed_syncs: m.failed_syncs.load(Ordering::Relaxed),
            consecutive_failures: m.consecutive_failures.load(Ordering::Relaxed),
            last_error: m.last_error.lock().clone(),
            last_sync_time: (last_sync_at > 0)
                .then(|| DateTime::from_timestamp_millis(last_sync_at))
                .flatten(),
            compression_ratio: if bytes_before == 0 {
                1.0
            } else {
                bytes_sent as f64 / bytes_before as f64
            },
            logs_queued: self.inner.log_queue.len() + self.inner.log_buffer.len(),
            logs_dropped: self.inner.log_queue.dropped.load(Ordering::Relaxed),
            circuit_state: self.inner.breaker.state(),
        }
    }

    /// Copy of the live configuration.
    pub fn config(&self) -> SyncConfig {
        self.inner.config.read().clone()
    }

    pub fn capability(&self) -> &DeviceCapability {
        &self.inner.capability
    }

    fn sync_interval(&self) -> Duration {
        self.inner.config.read().sync_interval
    }

    fn metadata(&self) -> SyncMetadata {
        let config = self.inner.config.read();
        SyncMetadata {
            device_id: config.device_id.clone(),
            org_id: config.org_id.clone(),
            sequence_number: self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            client_time: Utc::now(),
            capability: self.inner.capability.clone(),
        }
    }

    async fn sync_worker(self, mut trigger_rx: mpsc::Receiver<()>, mut stop_rx: watch::Receiver<bool>) {
        tokio::select! {
            _ = stop_rx.changed() => return,
            result = self.refresh_config() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to fetch sync config from server");
                }
            }
        }

        let mut period = self.sync_interval();
        let mut ticker = new_ticker(period);

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    debug!("Sync worker stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let _ = self.sync_now().await;
                }
                Some(()) = trigger_rx.recv() => {
                    let _ = self.sync_now().await;
                }
            }

            let current = self.sync_interval();
            if current != period {
                info!(interval_secs = current.as_secs(), "Sync interval changed");
                period = current;
                ticker = new_ticker(period);
            }
        }
    }

    async fn monitor_worker(self, mut stop_rx: watch::Receiver<bool>) {
        let period = self.inner.config.read().monitor_interval;
        let mut ticker = new_ticker(period);

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    debug!("Monitor worker stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.check_sync_health();
                }
            }
        }
    }
}

/// Interval whose first tick is one full period away.
fn new_ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Outbound bytes per second, from explicit config or the capability probe.
fn bandwidth_budget(config: &SyncConfig, capability: &DeviceCapability) -> Option<f64> {
    match config.bandwidth_limit {
        Some(bps) if bps > 0 => Some(bps as f64),
        _ if capability.bandwidth_kbps > 0 => Some(f64::from(capability.bandwidth_kbps) * 1000.0 / 8.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(msg: &str) -> LogEntry {
        LogEntry::new("test", crate::model::LogLevel::Info, msg)
    }

    #[test]
    fn test_log_queue_drops_oldest_when_full() {
        let queue = LogQueue::new(3);
        queue.push_back(vec![entry("a"), entry("b")]);
        queue.push_back(vec![entry("c"), entry("d")]);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped.load(Ordering::Relaxed), 1);
        let taken: Vec<String> = queue.take(10).into_iter().map(|e| e.message).collect();
        assert_eq!(taken, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_log_queue_requeue_preserves_order() {
        let queue = LogQueue::new(10);
        queue.push_back(vec![entry("a"), entry("b"), entry("c")]);

        let first = queue.take(2);
        queue.push_back(vec![entry("d")]);
        queue.push_front(first);

        let order: Vec<String> = queue.take(10).into_iter().map(|e| e.message).collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_sync_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let guard = SyncGuard::acquire(&flag);
        assert!(guard.is_some());
        assert!(SyncGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(SyncGuard::acquire(&flag).is_some());
    }

    #[test]
    fn test_bandwidth_budget_sources() {
        let capability = DeviceCapability::for_tier(Tier::Constrained);
        let mut config = SyncConfig::default();
        assert_eq!(bandwidth_budget(&config, &capability), None);

        let slow_link = capability.clone().with_bandwidth_kbps(80);
        assert_eq!(bandwidth_budget(&config, &slow_link), Some(10_000.0));

        config.bandwidth_limit = Some(2048);
        assert_eq!(bandwidth_budget(&config, &slow_link), Some(2048.0));
    }
}
