//! Composable wrappers around unary calls.
//!
//! Each interceptor is itself a [`UnaryCall`] holding the next link, so a
//! chain is just nested values. [`chain`] builds the standard order: auth
//! outermost, then retry, then logging closest to the transport, which means
//! every retry attempt is logged individually.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, trace, warn};

use crate::backoff::Backoff;
use crate::client::{is_retryable, ClientError};
use crate::transport::{RpcRequest, RpcResponse, UnaryCall};

pub const API_KEY_HEADER: HeaderName = HeaderName::from_static("x-api-key");

/// Bounds for retrying a single unary call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Worst-case wall time for one call when each attempt may take up to
    /// `per_attempt`: every attempt plus every backoff at its jittered cap.
    pub fn budget(&self, per_attempt: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        let backoff = Backoff::new(self.initial_backoff, self.max_backoff, self.multiplier);
        let waits: Duration = (1..attempts).map(|n| backoff.base_delay(n).mul_f64(1.25)).sum();
        per_attempt.saturating_mul(attempts).saturating_add(waits)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// Sets the API key header on every request.
pub struct AuthInterceptor<N> {
    api_key: Option<HeaderValue>,
    next: N,
}

impl<N> AuthInterceptor<N> {
    pub fn new(api_key: Option<&str>, next: N) -> Result<Self, ClientError> {
        let api_key = api_key
            .filter(|key| !key.is_empty())
            .map(|key| {
                let mut value = HeaderValue::from_str(key)
                    .map_err(|_| ClientError::Config("API key is not a valid header value".into()))?;
                value.set_sensitive(true);
                Ok::<_, ClientError>(value)
            })
            .transpose()?;
        Ok(Self { api_key, next })
    }

    /// Add the credentials to a header set built outside the chain.
    pub fn apply(&self, headers: &mut HeaderMap) {
        if let Some(key) = &self.api_key {
            headers.insert(API_KEY_HEADER, key.clone());
        }
    }
}

#[async_trait]
impl<N: UnaryCall> UnaryCall for AuthInterceptor<N> {
    async fn call(&self, mut request: RpcRequest) -> Result<RpcResponse, ClientError> {
        self.apply(&mut request.headers);
        self.next.call(request).await
    }
}

/// Retries retryable failures with exponential backoff.
pub struct RetryInterceptor<N> {
    policy: RetryPolicy,
    retryable: fn(&ClientError) -> bool,
    next: N,
}

impl<N> RetryInterceptor<N> {
    pub fn new(policy: RetryPolicy, next: N) -> Self {
        Self::with_predicate(policy, is_retryable, next)
    }

    pub fn with_predicate(policy: RetryPolicy, retryable: fn(&ClientError) -> bool, next: N) -> Self {
        Self {
            policy,
            retryable,
            next,
        }
    }
}

#[async_trait]
impl<N: UnaryCall> UnaryCall for RetryInterceptor<N> {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, ClientError> {
        let backoff = Backoff::new(
            self.policy.initial_backoff,
            self.policy.max_backoff,
            self.policy.multiplier,
        );
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.next.call(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < max_attempts && (self.retryable)(&e) => {
                    let delay = backoff.next();
                    warn!(
                        procedure = request.procedure,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Logs procedure, payload size, duration and outcome of each call.
pub struct LoggingInterceptor<N> {
    next: N,
}

impl<N> LoggingInterceptor<N> {
    pub fn new(next: N) -> Self {
        Self { next }
    }
}

#[async_trait]
impl<N: UnaryCall> UnaryCall for LoggingInterceptor<N> {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, ClientError> {
        let procedure = request.procedure;
        trace!(procedure, size = request.body.len(), "Sync request");

        let start = Instant::now();
        let result = self.next.call(request).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(response) => trace!(
                procedure,
                duration_ms,
                response_size = response.body.len(),
                "Sync request completed"
            ),
            Err(e) => debug!(procedure, duration_ms, error = %e, "Sync request failed"),
        }
        result
    }
}

/// The standard interceptor stack around a transport.
pub type InterceptedCall<N> = AuthInterceptor<RetryInterceptor<LoggingInterceptor<N>>>;

pub fn chain<N: UnaryCall>(
    transport: N,
    api_key: Option<&str>,
    policy: RetryPolicy,
) -> Result<InterceptedCall<N>, ClientError> {
    AuthInterceptor::new(
        api_key,
        RetryInterceptor::new(policy, LoggingInterceptor::new(transport)),
    )
}
