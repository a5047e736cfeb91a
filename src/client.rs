//! Sync service client.
//!
//! [`RpcSyncClient`] serializes requests, sends unary calls through the
//! interceptor chain and owns the lifecycle of the bidirectional stream. The
//! [`SyncClient`] trait is the seam the sync manager depends on.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::ClientConfig;
use crate::interceptor::{chain, InterceptedCall};
use crate::model::{
    GetSyncConfigRequest, GetSyncConfigResponse, StreamSyncRequest, StreamSyncResponse, SyncLogsRequest,
    SyncLogsResponse, SyncMetricsRequest, SyncMetricsResponse,
};
use crate::transport::{
    HttpTransport, RawStream, RpcCode, RpcRequest, Transport, UnaryCall, GET_SYNC_CONFIG, STREAM_SYNC, SYNC_LOGS,
    SYNC_METRICS,
};

/// Errors that can occur while talking to the sync service.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("rpc error [{code}]: {message}")]
    Rpc { code: RpcCode, message: String },

    #[error("failed to encode request: {0}")]
    Encode(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("stream closed")]
    StreamClosed,

    #[error("client is closed")]
    Closed,

    #[error("client configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else {
            ClientError::Network(err)
        }
    }
}

/// Whether a failed call is worth retrying.
///
/// Network failures and the transient status codes qualify. Anything the
/// server answered deliberately, and any local encode/decode failure, does not.
pub fn is_retryable(error: &ClientError) -> bool {
    match error {
        ClientError::Rpc { code, .. } => matches!(
            code,
            RpcCode::Unavailable | RpcCode::ResourceExhausted | RpcCode::DeadlineExceeded | RpcCode::Aborted
        ),
        ClientError::Network(e) => e.is_connect() || e.is_timeout() || e.is_request() || e.is_body(),
        ClientError::Timeout => true,
        ClientError::Encode(_)
        | ClientError::Decode(_)
        | ClientError::StreamClosed
        | ClientError::Closed
        | ClientError::Config(_) => false,
    }
}

/// Operations the sync manager needs from the remote service.
#[async_trait]
pub trait SyncClient: Send + Sync {
    async fn sync_metrics(&self, request: &SyncMetricsRequest) -> Result<SyncMetricsResponse, ClientError>;

    async fn sync_logs(&self, request: &SyncLogsRequest) -> Result<SyncLogsResponse, ClientError>;

    async fn get_sync_config(&self, request: &GetSyncConfigRequest) -> Result<GetSyncConfigResponse, ClientError>;

    /// Open the bidirectional sync stream.
    async fn stream_sync(&self) -> Result<SyncStream, ClientError>;

    /// Release pooled connections.
    fn close(&self);
}

/// Typed handle on the bidirectional sync stream.
pub struct SyncStream {
    raw: RawStream,
}

impl SyncStream {
    pub fn new(raw: RawStream) -> Self {
        Self { raw }
    }

    pub async fn send(&self, request: &StreamSyncRequest) -> Result<(), ClientError> {
        let body = serde_json::to_vec(request).map_err(|e| ClientError::Encode(e.to_string()))?;
        self.raw.send(Bytes::from(body)).await
    }

    /// Next response, or `None` once the server has ended the stream.
    pub async fn receive(&mut self) -> Result<Option<StreamSyncResponse>, ClientError> {
        match self.raw.receive().await {
            None => Ok(None),
            Some(Err(e)) => Err(e),
            Some(Ok(body)) => serde_json::from_slice(&body)
                .map(Some)
                .map_err(|e| ClientError::Decode(e.to_string())),
        }
    }

    /// Stop sending. Responses already in flight can still be received.
    pub fn close(&mut self) {
        self.raw.close_send();
    }
}

/// [`SyncClient`] over a [`Transport`], with the standard interceptors.
pub struct RpcSyncClient<T: Transport> {
    transport: Arc<T>,
    unary: InterceptedCall<Arc<T>>,
}

impl RpcSyncClient<HttpTransport> {
    /// Create an HTTP-backed client.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built or the
    /// API key is not a valid header value.
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let transport = HttpTransport::new(&config.server_url, config.request_timeout)?;
        Self::with_transport(Arc::new(transport), config)
    }
}

impl<T: Transport + 'static> RpcSyncClient<T> {
    pub fn with_transport(transport: Arc<T>, config: &ClientConfig) -> Result<Self, ClientError> {
        let unary = chain(transport.clone(), config.api_key.as_deref(), config.retry.clone())?;
        Ok(Self { transport, unary })
    }

    async fn unary<Req, Resp>(&self, procedure: &'static str, request: &Req) -> Result<Resp, ClientError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request).map_err(|e| ClientError::Encode(e.to_string()))?;
        let response = self.unary.call(RpcRequest::new(procedure, Bytes::from(body))).await?;
        serde_json::from_slice(&response.body).map_err(|e| ClientError::Decode(e.to_string()))
    }
}

#[async_trait]
impl<T: Transport + 'static> SyncClient for RpcSyncClient<T> {
    async fn sync_metrics(&self, request: &SyncMetricsRequest) -> Result<SyncMetricsResponse, ClientError> {
        self.unary(SYNC_METRICS, request).await
    }

    async fn sync_logs(&self, request: &SyncLogsRequest) -> Result<SyncLogsResponse, ClientError> {
        self.unary(SYNC_LOGS, request).await
    }

    async fn get_sync_config(&self, request: &GetSyncConfigRequest) -> Result<GetSyncConfigResponse, ClientError> {
        self.unary(GET_SYNC_CONFIG, request).await
    }

    async fn stream_sync(&self) -> Result<SyncStream, ClientError> {
        let mut headers = HeaderMap::new();
        self.unary.apply(&mut headers);
        let raw = self.transport.open_stream(STREAM_SYNC, headers).await?;
        Ok(SyncStream::new(raw))
    }

    fn close(&self) {
        debug!("Closing sync client");
        self.transport.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{DeviceCapability, Tier};
    use crate::interceptor::RetryPolicy;
    use crate::model::{Metric, MetricsBatch, StreamPayload, SyncMetadata};
    use crate::transport::RpcResponse;
    use chrono::Utc;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct FakeTransport {
        responses: Mutex<VecDeque<Result<RpcResponse, ClientError>>>,
        requests: Mutex<Vec<RpcRequest>>,
        stream_headers: Mutex<Option<HeaderMap>>,
        stream_ends: Mutex<Option<(futures::channel::mpsc::Receiver<Bytes>, mpsc::Sender<Result<Bytes, ClientError>>)>>,
        closed: Mutex<bool>,
    }

    impl FakeTransport {
        fn respond(&self, result: Result<RpcResponse, ClientError>) {
            self.responses.lock().push_back(result);
        }
    }

    #[async_trait]
    impl UnaryCall for FakeTransport {
        async fn call(&self, request: RpcRequest) -> Result<RpcResponse, ClientError> {
            self.requests.lock().push(request);
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ClientError::Closed))
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn open_stream(&self, _procedure: &'static str, headers: HeaderMap) -> Result<RawStream, ClientError> {
            let (out_tx, out_rx) = futures::channel::mpsc::channel(4);
            let (in_tx, in_rx) = mpsc::channel(4);
            *self.stream_headers.lock() = Some(headers);
            *self.stream_ends.lock() = Some((out_rx, in_tx));
            Ok(RawStream::new(out_tx, in_rx))
        }

        fn close(&self) {
            *self.closed.lock() = true;
        }
    }

    fn test_config() -> ClientConfig {
        ClientConfig {
            server_url: "http://sync.test".into(),
            api_key: Some("key-123".into()),
            request_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                multiplier: 2.0,
            },
        }
    }

    fn metadata() -> SyncMetadata {
        SyncMetadata {
            device_id: "dev-1".into(),
            org_id: "org-1".into(),
            sequence_number: 1,
            client_time: Utc::now(),
            capability: DeviceCapability::for_tier(Tier::Minimal),
        }
    }

    fn json_response(body: &str) -> Result<RpcResponse, ClientError> {
        Ok(RpcResponse {
            headers: HeaderMap::new(),
            body: Bytes::from(body.to_string()),
        })
    }

    #[test]
    fn test_client_error_display() {
        assert_eq!(ClientError::Timeout.to_string(), "request timed out");

        let err = ClientError::Rpc {
            code: RpcCode::InvalidArgument,
            message: "Invalid JSON".to_string(),
        };
        assert!(err.to_string().contains("invalid_argument"));
        assert!(err.to_string().contains("Invalid JSON"));
    }

    #[test]
    fn test_retryable_error_detection() {
        assert!(is_retryable(&ClientError::Timeout));
        for code in [
            RpcCode::Unavailable,
            RpcCode::ResourceExhausted,
            RpcCode::DeadlineExceeded,
            RpcCode::Aborted,
        ] {
            assert!(is_retryable(&ClientError::Rpc { code, message: String::new() }), "{code}");
        }

        assert!(!is_retryable(&ClientError::Rpc {
            code: RpcCode::PermissionDenied,
            message: String::new(),
        }));
        assert!(!is_retryable(&ClientError::Decode("invalid json".into())));
        assert!(!is_retryable(&ClientError::Config("bad".into())));
        assert!(!is_retryable(&ClientError::Closed));
    }

    #[test]
    fn test_http_client_creation() {
        assert!(RpcSyncClient::new(&test_config()).is_ok());

        let mut config = test_config();
        config.api_key = Some("line\nbreak".into());
        assert!(matches!(RpcSyncClient::new(&config), Err(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn test_sync_metrics_round_trip() {
        let transport = Arc::new(FakeTransport::default());
        transport.respond(json_response(
            r#"{"success":true,"configUpdate":{"batchSize":50}}"#,
        ));
        let client = RpcSyncClient::with_transport(transport.clone(), &test_config()).unwrap();

        let request = SyncMetricsRequest {
            metadata: metadata(),
            batch: MetricsBatch::Plain {
                metrics: vec![Metric::new("cpu", 1.0).with_id(1)],
            },
        };
        let response = client.sync_metrics(&request).await.unwrap();
        assert!(response.success);
        assert_eq!(response.config_update.unwrap().batch_size, 50);

        let sent = transport.requests.lock();
        assert_eq!(sent[0].procedure, SYNC_METRICS);
        assert_eq!(sent[0].headers.get("x-api-key").unwrap(), "key-123");
        let body: serde_json::Value = serde_json::from_slice(&sent[0].body).unwrap();
        assert_eq!(body["metadata"]["deviceId"], "dev-1");
    }

    #[tokio::test]
    async fn test_retries_through_chain() {
        let transport = Arc::new(FakeTransport::default());
        transport.respond(Err(ClientError::Rpc {
            code: RpcCode::Unavailable,
            message: "overloaded".into(),
        }));
        transport.respond(json_response(r#"{"success":true}"#));
        let client = RpcSyncClient::with_transport(transport.clone(), &test_config()).unwrap();

        let request = SyncLogsRequest {
            metadata: metadata(),
            logs: vec![],
        };
        assert!(client.sync_logs(&request).await.unwrap().success);
        assert_eq!(transport.requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_response_is_decode_error() {
        let transport = Arc::new(FakeTransport::default());
        transport.respond(json_response("not json"));
        let client = RpcSyncClient::with_transport(transport, &test_config()).unwrap();

        let request = GetSyncConfigRequest {
            device_id: "dev-1".into(),
            org_id: "org-1".into(),
            capability: DeviceCapability::for_tier(Tier::Full),
        };
        assert!(matches!(
            client.get_sync_config(&request).await,
            Err(ClientError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_sync_duplex() {
        let transport = Arc::new(FakeTransport::default());
        let client = RpcSyncClient::with_transport(transport.clone(), &test_config()).unwrap();

        let mut stream = client.stream_sync().await.unwrap();
        let headers = transport.stream_headers.lock().take().unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "key-123");
        let (mut server_rx, server_tx) = transport.stream_ends.lock().take().unwrap();

        stream
            .send(&StreamSyncRequest {
                metadata: metadata(),
                payload: StreamPayload::Heartbeat,
            })
            .await
            .unwrap();
        let frame = server_rx.next().await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(value["payload"]["type"], "heartbeat");

        server_tx
            .send(Ok(Bytes::from_static(br#"{"ackSequence":1,"success":true}"#)))
            .await
            .unwrap();
        drop(server_tx);

        let ack = stream.receive().await.unwrap().unwrap();
        assert_eq!(ack.ack_sequence, 1);
        assert!(stream.receive().await.unwrap().is_none());

        stream.close();
        assert!(server_rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_releases_transport() {
        let transport = Arc::new(FakeTransport::default());
        let client = RpcSyncClient::with_transport(transport.clone(), &test_config()).unwrap();
        client.close();
        assert!(*transport.closed.lock());
    }
}
