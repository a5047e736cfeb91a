//! Generic size- and time-triggered batch buffer.
//!
//! Items accumulate until either `max_size` is reached, which flushes from
//! within [`BatchBuffer::add`], or `max_wait` elapses after the first item of
//! a batch, which flushes from a one-shot timer task. Every mutation and every
//! flush runs under one lock, so a size flush and a timer flush can never see
//! overlapping contents.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Boxed error returned by flush callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Default number of items per batch.
const DEFAULT_MAX_SIZE: usize = 100;

/// Default time to hold a partial batch.
const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(5);

/// Configuration for a batch buffer.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Number of items that triggers an immediate flush
    pub max_size: usize,

    /// Longest time a partial batch is held before flushing
    pub max_wait: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

impl BufferConfig {
    pub fn new(max_size: usize, max_wait: Duration) -> Self {
        Self {
            max_size: max_size.max(1),
            max_wait,
        }
    }
}

/// Statistics about buffer operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub items_received: u64,
    pub items_flushed: u64,
    pub size_flushes: u64,
    pub time_flushes: u64,
    pub manual_flushes: u64,
    pub failed_flushes: u64,
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("flush callback failed: {0}")]
    Flush(#[source] BoxError),

    /// Arming the flush timer needs a Tokio runtime
    #[error("no Tokio runtime available for the flush timer")]
    NoRuntime,
}

#[derive(Debug, Clone, Copy)]
enum FlushReason {
    Size,
    Time,
    Manual,
}

type FlushFn<T> = Box<dyn Fn(Vec<T>) -> Result<(), BoxError> + Send + Sync>;

struct State<T> {
    items: Vec<T>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every flush; a timer only fires for its own generation
    generation: u64,
    stats: BufferStats,
}

struct Shared<T> {
    config: BufferConfig,
    flush_fn: FlushFn<T>,
    state: Mutex<State<T>>,
}

impl<T> Shared<T> {
    fn flush_locked(&self, state: &mut State<T>, reason: FlushReason) -> Result<(), BufferError> {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation = state.generation.wrapping_add(1);

        if state.items.is_empty() {
            return Ok(());
        }

        let items = std::mem::replace(&mut state.items, Vec::with_capacity(self.config.max_size));
        let count = items.len() as u64;

        match reason {
            FlushReason::Size => state.stats.size_flushes += 1,
            FlushReason::Time => state.stats.time_flushes += 1,
            FlushReason::Manual => state.stats.manual_flushes += 1,
        }
        debug!(batch_size = count, reason = ?reason, "Flushing batch buffer");

        match (self.flush_fn)(items) {
            Ok(()) => {
                state.stats.items_flushed += count;
                Ok(())
            }
            Err(e) => {
                state.stats.failed_flushes += 1;
                Err(BufferError::Flush(e))
            }
        }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

/// Reusable accumulator, independent of the payload type.
///
/// The flush callback runs while the buffer lock is held and must not call
/// back into the same buffer.
pub struct BatchBuffer<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> BatchBuffer<T> {
    pub fn new<F>(config: BufferConfig, flush_fn: F) -> Self
    where
        F: Fn(Vec<T>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let state = State {
            items: Vec::with_capacity(config.max_size),
            timer: None,
            generation: 0,
            stats: BufferStats::default(),
        };

        Self {
            shared: Arc::new(Shared {
                config,
                flush_fn: Box::new(flush_fn),
                state: Mutex::new(state),
            }),
        }
    }

    /// Append an item, flushing immediately once `max_size` is reached.
    ///
    /// If the item would arm the timer outside a Tokio runtime, it is
    /// rejected with `NoRuntime` and the buffer is left unchanged.
    pub fn add(&self, item: T) -> Result<(), BufferError> {
        let mut state = self.shared.state.lock();
        let fills_batch = state.items.len() + 1 >= self.shared.config.max_size;

        let runtime = if !fills_batch && state.timer.is_none() {
            Some(tokio::runtime::Handle::try_current().map_err(|_| BufferError::NoRuntime)?)
        } else {
            None
        };

        state.items.push(item);
        state.stats.items_received += 1;

        if fills_batch {
            return self.shared.flush_locked(&mut state, FlushReason::Size);
        }

        if let Some(runtime) = runtime {
            let generation = state.generation;
            let max_wait = self.shared.config.max_wait;
            let weak = Arc::downgrade(&self.shared);
            state.timer = Some(runtime.spawn(flush_after(weak, generation, max_wait)));
        }

        Ok(())
    }

    /// Flush whatever is buffered now.
    pub fn flush(&self) -> Result<(), BufferError> {
        let mut state = self.shared.state.lock();
        self.shared.flush_locked(&mut state, FlushReason::Manual)
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().items.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        self.shared.state.lock().stats.clone()
    }

    pub fn config(&self) -> &BufferConfig {
        &self.shared.config
    }
}

async fn flush_after<T>(shared: Weak<Shared<T>>, generation: u64, max_wait: Duration) {
    tokio::time::sleep(max_wait).await;

    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut state = shared.state.lock();
    if state.generation != generation {
        return;
    }
    // Detach our own handle so the flush does not abort the running task
    state.timer = None;
    if let Err(e) = shared.flush_locked(&mut state, FlushReason::Time) {
        warn!(error = %e, "Timer-triggered flush failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collecting_buffer(
        max_size: usize,
        max_wait: Duration,
    ) -> (BatchBuffer<u32>, Arc<Mutex<Vec<Vec<u32>>>>) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        let buffer = BatchBuffer::new(BufferConfig::new(max_size, max_wait), move |items| {
            sink.lock().push(items);
            Ok(())
        });
        (buffer, batches)
    }

    #[test]
    fn test_buffer_config_default() {
        let config = BufferConfig::default();
        assert_eq!(config.max_size, 100);
        assert_eq!(config.max_wait, Duration::from_secs(5));
        assert_eq!(BufferConfig::new(0, Duration::ZERO).max_size, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_based_flush_is_synchronous() {
        let (buffer, batches) = collecting_buffer(3, Duration::from_secs(60));

        buffer.add(1).unwrap();
        buffer.add(2).unwrap();
        assert!(batches.lock().is_empty());

        buffer.add(3).unwrap();
        assert_eq!(*batches.lock(), vec![vec![1, 2, 3]]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().size_flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_based_flush() {
        let (buffer, batches) = collecting_buffer(100, Duration::from_millis(50));

        buffer.add(7).unwrap();
        buffer.add(8).unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(*batches.lock(), vec![vec![7, 8]]);
        assert_eq!(buffer.stats().time_flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_flush_cancels_pending_timer() {
        let (buffer, batches) = collecting_buffer(2, Duration::from_millis(50));

        buffer.add(1).unwrap();
        buffer.add(2).unwrap();
        buffer.add(3).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        // Timer armed by item 1 was cancelled; item 3 has its own timer
        assert_eq!(*batches.lock(), vec![vec![1, 2]]);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(*batches.lock(), vec![vec![1, 2], vec![3]]);
        assert_eq!(buffer.stats().time_flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_flush() {
        let (buffer, batches) = collecting_buffer(10, Duration::from_secs(60));
        buffer.flush().unwrap();
        assert!(batches.lock().is_empty());

        buffer.add(5).unwrap();
        buffer.flush().unwrap();
        assert_eq!(*batches.lock(), vec![vec![5]]);
        assert_eq!(buffer.stats().manual_flushes, 1);
        assert_eq!(buffer.stats().items_flushed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_error_is_reported() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let buffer = BatchBuffer::new(BufferConfig::new(1, Duration::from_secs(1)), move |_items: Vec<u8>| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("downstream unavailable".into())
        });

        let err = buffer.add(1).unwrap_err();
        assert!(matches!(err, BufferError::Flush(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.stats().failed_flushes, 1);
    }

    #[test]
    fn test_add_without_runtime_reports_error() {
        let (buffer, _batches) = collecting_buffer(10, Duration::from_secs(1));
        assert!(matches!(buffer.add(1), Err(BufferError::NoRuntime)));
        assert!(matches!(buffer.add(1), Err(BufferError::NoRuntime)));

        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().items_received, 0);
    }

    #[test]
    fn test_size_flush_needs_no_runtime() {
        let (buffer, batches) = collecting_buffer(1, Duration::from_secs(1));
        buffer.add(7).unwrap();

        assert!(buffer.is_empty());
        assert_eq!(*batches.lock(), vec![vec![7]]);
    }
}
