//! RPC transport for the sync service.
//!
//! Unary calls are plain JSON POSTs to `{base}/{service}/{method}`. Failed
//! calls answer with a non-2xx status and a `{code, message}` body. The
//! bidirectional stream exchanges enveloped JSON frames: one flag byte, a
//! big-endian `u32` length, then the payload. The final frame from the server
//! carries [`FLAG_END_STREAM`] and may hold an error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::channel::mpsc as stream_mpsc;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::client::ClientError;

pub const SYNC_METRICS: &str = "/edgesync.v1.SyncService/SyncMetrics";
pub const SYNC_LOGS: &str = "/edgesync.v1.SyncService/SyncLogs";
pub const GET_SYNC_CONFIG: &str = "/edgesync.v1.SyncService/GetSyncConfig";
pub const STREAM_SYNC: &str = "/edgesync.v1.SyncService/StreamSync";

pub const FLAG_COMPRESSED: u8 = 0x01;
pub const FLAG_END_STREAM: u8 = 0x02;

const ENVELOPE_HEADER_LEN: usize = 5;

/// Frames larger than this are rejected rather than buffered.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Messages buffered in each direction of a stream.
const STREAM_BUFFER: usize = 16;

const UNARY_CONTENT_TYPE: &str = "application/json";
const STREAM_CONTENT_TYPE: &str = "application/connect+json";

/// Status codes carried by failed calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcCode {
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl RpcCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcCode::Canceled => "canceled",
            RpcCode::Unknown => "unknown",
            RpcCode::InvalidArgument => "invalid_argument",
            RpcCode::DeadlineExceeded => "deadline_exceeded",
            RpcCode::NotFound => "not_found",
            RpcCode::AlreadyExists => "already_exists",
            RpcCode::PermissionDenied => "permission_denied",
            RpcCode::ResourceExhausted => "resource_exhausted",
            RpcCode::FailedPrecondition => "failed_precondition",
            RpcCode::Aborted => "aborted",
            RpcCode::OutOfRange => "out_of_range",
            RpcCode::Unimplemented => "unimplemented",
            RpcCode::Internal => "internal",
            RpcCode::Unavailable => "unavailable",
            RpcCode::DataLoss => "data_loss",
            RpcCode::Unauthenticated => "unauthenticated",
        }
    }

    /// Parse a wire code. Unrecognized codes map to `Unknown`.
    pub fn parse(code: &str) -> Self {
        match code {
            "canceled" | "cancelled" => RpcCode::Canceled,
            "invalid_argument" => RpcCode::InvalidArgument,
            "deadline_exceeded" => RpcCode::DeadlineExceeded,
            "not_found" => RpcCode::NotFound,
            "already_exists" => RpcCode::AlreadyExists,
            "permission_denied" => RpcCode::PermissionDenied,
            "resource_exhausted" => RpcCode::ResourceExhausted,
            "failed_precondition" => RpcCode::FailedPrecondition,
            "aborted" => RpcCode::Aborted,
            "out_of_range" => RpcCode::OutOfRange,
            "unimplemented" => RpcCode::Unimplemented,
            "internal" => RpcCode::Internal,
            "unavailable" => RpcCode::Unavailable,
            "data_loss" => RpcCode::DataLoss,
            "unauthenticated" => RpcCode::Unauthenticated,
            _ => RpcCode::Unknown,
        }
    }

    /// Code implied by an HTTP status when the body does not name one.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 => RpcCode::Internal,
            401 => RpcCode::Unauthenticated,
            403 => RpcCode::PermissionDenied,
            404 => RpcCode::Unimplemented,
            408 => RpcCode::DeadlineExceeded,
            429 | 502 | 503 | 504 => RpcCode::Unavailable,
            _ => RpcCode::Unknown,
        }
    }
}

impl std::fmt::Display for RpcCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct EndStream {
    #[serde(default)]
    error: Option<ErrorBody>,
}

fn rpc_error(status: StatusCode, body: &[u8]) -> ClientError {
    let parsed: ErrorBody = serde_json::from_slice(body).unwrap_or_default();
    let code = parsed
        .code
        .as_deref()
        .map(RpcCode::parse)
        .unwrap_or_else(|| RpcCode::from_http_status(status.as_u16()));
    let message = if parsed.message.is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_string()
    } else {
        parsed.message
    };
    ClientError::Rpc { code, message }
}

/// A serialized unary request.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub procedure: &'static str,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RpcRequest {
    pub fn new(procedure: &'static str, body: Bytes) -> Self {
        Self {
            procedure,
            headers: HeaderMap::new(),
            body,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RpcResponse {
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// One unary round trip. Interceptors implement this by wrapping another
/// `UnaryCall`.
#[async_trait]
pub trait UnaryCall: Send + Sync {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, ClientError>;
}

#[async_trait]
impl<T: UnaryCall + ?Sized> UnaryCall for Arc<T> {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, ClientError> {
        (**self).call(request).await
    }
}

/// A full transport: unary calls plus stream setup and teardown.
#[async_trait]
pub trait Transport: UnaryCall {
    async fn open_stream(&self, procedure: &'static str, headers: HeaderMap) -> Result<RawStream, ClientError>;

    /// Release pooled connections. Later calls fail with `Closed`.
    fn close(&self);
}

/// One decoded stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub flags: u8,
    pub data: Bytes,
}

impl Envelope {
    pub fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }
}

pub fn encode_envelope(flags: u8, payload: &[u8]) -> Result<Bytes, ClientError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(ClientError::Encode(format!(
            "frame of {} bytes exceeds limit of {}",
            payload.len(),
            MAX_FRAME_LEN
        )));
    }
    let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_LEN + payload.len());
    buf.put_u8(flags);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Incremental frame decoder for a chunked byte stream.
#[derive(Debug, Default)]
pub struct EnvelopeDecoder {
    buf: BytesMut,
}

impl EnvelopeDecoder {
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<Envelope>, ClientError> {
        if self.buf.len() < ENVELOPE_HEADER_LEN {
            return Ok(None);
        }
        let flags = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ClientError::Decode(format!(
                "frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
            )));
        }
        if self.buf.len() < ENVELOPE_HEADER_LEN + len {
            return Ok(None);
        }

        self.buf.advance(ENVELOPE_HEADER_LEN);
        let data = self.buf.split_to(len).freeze();
        Ok(Some(Envelope { flags, data }))
    }

    /// Bytes held that do not yet form a frame.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

/// Untyped duplex message stream.
///
/// Outbound messages are raw payloads; framing is the transport's concern.
/// Inbound items are payloads or the error that ended the stream.
pub struct RawStream {
    outbound: Option<stream_mpsc::Sender<Bytes>>,
    inbound: mpsc::Receiver<Result<Bytes, ClientError>>,
}

impl RawStream {
    pub fn new(
        outbound: stream_mpsc::Sender<Bytes>,
        inbound: mpsc::Receiver<Result<Bytes, ClientError>>,
    ) -> Self {
        Self {
            outbound: Some(outbound),
            inbound,
        }
    }

    pub async fn send(&self, message: Bytes) -> Result<(), ClientError> {
        let mut outbound = self.outbound.clone().ok_or(ClientError::StreamClosed)?;
        outbound.send(message).await.map_err(|_| ClientError::StreamClosed)
    }

    /// `None` once the server has finished the stream cleanly.
    pub async fn receive(&mut self) -> Option<Result<Bytes, ClientError>> {
        self.inbound.recv().await
    }

    /// Half-close: no more sends, responses can still be received.
    pub fn close_send(&mut self) {
        self.outbound = None;
    }
}

/// HTTP transport backed by a pooled `reqwest` client.
pub struct HttpTransport {
    base_url: String,
    timeout: Duration,
    client: RwLock<Option<reqwest::Client>>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            client: RwLock::new(Some(client)),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn client(&self) -> Result<reqwest::Client, ClientError> {
        self.client.read().clone().ok_or(ClientError::Closed)
    }

    fn url(&self, procedure: &str) -> String {
        format!("{}{}", self.base_url, procedure)
    }
}

#[async_trait]
impl UnaryCall for HttpTransport {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, ClientError> {
        let client = self.client()?;

        let response = client
            .post(self.url(request.procedure))
            .headers(request.headers)
            .header(CONTENT_TYPE, HeaderValue::from_static(UNARY_CONTENT_TYPE))
            .timeout(self.timeout)
            .body(request.body)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        if status.is_success() {
            Ok(RpcResponse { headers, body })
        } else {
            Err(rpc_error(status, &body))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open_stream(&self, procedure: &'static str, headers: HeaderMap) -> Result<RawStream, ClientError> {
        let client = self.client()?;
        let (out_tx, out_rx) = stream_mpsc::channel::<Bytes>(STREAM_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(STREAM_BUFFER);

        let frames = out_rx.map(|message| encode_envelope(0, &message));

        let request = client
            .post(self.url(procedure))
            .headers(headers)
            .header(CONTENT_TYPE, HeaderValue::from_static(STREAM_CONTENT_TYPE))
            .body(reqwest::Body::wrap_stream(frames));

        debug!(procedure, "Opening sync stream");
        tokio::spawn(async move {
            if let Err(e) = pump_stream(request, &in_tx).await {
                let _ = in_tx.send(Err(e)).await;
            }
        });

        Ok(RawStream::new(out_tx, in_rx))
    }

    fn close(&self) {
        if self.client.write().take().is_some() {
            debug!(base_url = %self.base_url, "HTTP transport closed");
        }
    }
}

async fn pump_stream(
    request: reqwest::RequestBuilder,
    inbound: &mpsc::Sender<Result<Bytes, ClientError>>,
) -> Result<(), ClientError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.bytes().await?;
        return Err(rpc_error(status, &body));
    }

    let mut decoder = EnvelopeDecoder::default();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        decoder.push(&chunk?);

        while let Some(frame) = decoder.next_frame()? {
            if frame.is_end_stream() {
                let end: EndStream = if frame.data.is_empty() {
                    EndStream::default()
                } else {
                    serde_json::from_slice(&frame.data).map_err(|e| ClientError::Decode(e.to_string()))?
                };
                return match end.error {
                    Some(error) => Err(ClientError::Rpc {
                        code: error.code.as_deref().map(RpcCode::parse).unwrap_or(RpcCode::Unknown),
                        message: error.message,
                    }),
                    None => Ok(()),
                };
            }
            if frame.flags & FLAG_COMPRESSED != 0 {
                return Err(ClientError::Decode("compressed stream frames are not supported".into()));
            }

            trace!(bytes = frame.data.len(), "Stream frame received");
            if inbound.send(Ok(frame.data)).await.is_err() {
                // Receiver dropped
                return Ok(());
            }
        }
    }

    if decoder.remaining() > 0 {
        return Err(ClientError::Decode("stream ended mid-frame".into()));
    }
    Ok(())
}
