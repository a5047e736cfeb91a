//! Three-state circuit breaker.
//!
//! The lock is never held across the wrapped future, so a slow call does not
//! block state queries from other tasks.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The wrapped operation was not invoked
    #[error("circuit breaker is open")]
    Open,

    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
            }),
        }
    }

    /// Run `f` under the breaker.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit()?;

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitError::Inner(e))
            }
        }
    }

    fn admit<E>(&self) -> Result<(), CircuitError<E>> {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure
                .map(|at| at.elapsed())
                .unwrap_or(self.reset_timeout);
            if elapsed < self.reset_timeout {
                return Err(CircuitError::Open);
            }
            debug!("Circuit reset timeout elapsed, probing in half-open state");
            inner.state = CircuitState::HalfOpen;
            inner.failures = 0;
        }
        Ok(())
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            debug!("Circuit closed after successful trial call");
            inner.state = CircuitState::Closed;
        }
        inner.failures = 0;
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures = inner.failures.saturating_add(1);

        let trip = inner.state == CircuitState::HalfOpen || inner.failures >= self.failure_threshold;
        if trip {
            if inner.state != CircuitState::Open {
                warn!(
                    failures = inner.failures,
                    reset_timeout_ms = self.reset_timeout.as_millis() as u64,
                    "Circuit opened"
                );
            }
            inner.state = CircuitState::Open;
            inner.last_failure = Some(Instant::now());
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }
}
