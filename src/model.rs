//! Telemetry records and sync protocol messages.
//!
//! Field names follow the server's JSON mapping (lowerCamelCase).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capability::DeviceCapability;
use crate::compression::CompressionType;

/// Log severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Get all possible log levels.
    pub fn all() -> &'static [LogLevel] {
        &[
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
            LogLevel::Fatal,
        ]
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
            LogLevel::Fatal => write!(f, "fatal"),
        }
    }
}

/// A single metric data point held in local storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    /// Storage-assigned identifier, 0 until stored
    #[serde(default)]
    pub id: i64,

    pub timestamp: DateTime<Utc>,

    pub name: String,

    pub value: f64,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            name: name.into(),
            value,
            labels: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// A single log line from the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    pub timestamp: DateTime<Utc>,

    /// Component or sensor that emitted the line
    pub source_id: String,

    pub level: LogLevel,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl LogEntry {
    pub fn new(source_id: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: Some(Uuid::new_v4()),
            timestamp: Utc::now(),
            source_id: source_id.into(),
            level,
            message: message.into(),
            metadata: None,
        }
    }

    /// Add metadata to the log entry.
    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Compressed form of a serialized record list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionEnvelope {
    pub codec: CompressionType,

    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,

    /// Length of the serialized record list before compression
    pub original_size: u64,
}

/// A batch of metrics as it travels to the server.
///
/// The two variants are alternative encodings of the same payload; a batch
/// never carries both records and a compressed envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "camelCase")]
pub enum MetricsBatch {
    Plain { metrics: Vec<Metric> },
    Compressed(CompressionEnvelope),
}

impl MetricsBatch {
    /// Codec the payload is encoded with.
    pub fn codec(&self) -> CompressionType {
        match self {
            MetricsBatch::Plain { .. } => CompressionType::None,
            MetricsBatch::Compressed(env) => env.codec,
        }
    }
}

/// Identity and ordering metadata attached to every sync request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub device_id: String,
    pub org_id: String,

    /// Best-effort ordering hint, seeded from wall-clock time at startup
    pub sequence_number: i64,

    pub client_time: DateTime<Utc>,

    pub capability: DeviceCapability,
}

/// Configuration delta pushed by the server. Zero/empty fields mean "keep".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfigUpdate {
    pub batch_size: u32,
    pub sync_interval_seconds: u32,
    pub compression_type: String,
    pub compression_enabled: bool,
}

impl SyncConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.batch_size == 0 && self.sync_interval_seconds == 0 && self.compression_type.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetricsRequest {
    pub metadata: SyncMetadata,
    pub batch: MetricsBatch,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncMetricsResponse {
    pub success: bool,
    pub error_message: String,
    pub config_update: Option<SyncConfigUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogsRequest {
    pub metadata: SyncMetadata,
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncLogsResponse {
    pub success: bool,
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetSyncConfigRequest {
    pub device_id: String,
    pub org_id: String,
    pub capability: DeviceCapability,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetSyncConfigResponse {
    pub config: SyncConfigUpdate,
}

/// Payload of one message on the bidirectional sync stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamPayload {
    Metrics { batch: MetricsBatch },
    Logs { logs: Vec<LogEntry> },
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSyncRequest {
    pub metadata: SyncMetadata,
    pub payload: StreamPayload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSyncResponse {
    /// Highest sequence number the server has durably accepted
    pub ack_sequence: i64,
    pub success: bool,
    pub error_message: String,
    pub config_update: Option<SyncConfigUpdate>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
