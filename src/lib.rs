//! Edge Sync Library
//!
//! Ships locally buffered device telemetry to a central sync service over an
//! unreliable network, adapting cadence and payload to the device:
//!
//! - **capability**: device probe and per-tier sync defaults
//! - **compression**: pluggable batch codecs (none, gzip, zstd)
//! - **backoff**, **circuit_breaker**, **rate_limit**: resilience primitives
//! - **buffer**: generic batch buffer with size and time flush triggers
//! - **storage**: the local storage contract and an in-memory ring
//! - **transport**, **interceptor**, **client**: RPC client for the sync service
//! - **manager**: sync orchestration, health monitoring and shutdown
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use edge_sync::capability::DeviceCapability;
//! use edge_sync::client::RpcSyncClient;
//! use edge_sync::config::Config;
//! use edge_sync::manager::SyncManager;
//! use edge_sync::model::Metric;
//! use edge_sync::storage::{MemoryStorage, Storage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let capability = DeviceCapability::detect();
//!
//!     let storage = Arc::new(MemoryStorage::new(capability.max_metrics_in_memory));
//!     let client = Arc::new(RpcSyncClient::new(&config.client)?);
//!
//!     let manager = SyncManager::new(storage.clone(), client, capability, config.sync);
//!     manager.start()?;
//!
//!     storage.store_metric(Metric::new("cpu.usage", 42.0))?;
//!     manager.trigger_sync();
//!
//!     manager.stop().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod buffer;
pub mod capability;
pub mod circuit_breaker;
pub mod client;
pub mod compression;
pub mod config;
pub mod generator;
pub mod interceptor;
pub mod manager;
pub mod model;
pub mod rate_limit;
pub mod storage;
pub mod transport;

pub use buffer::{BatchBuffer, BufferConfig, BufferError, BufferStats};
pub use capability::{DeviceCapability, Tier};
pub use client::{ClientError, RpcSyncClient, SyncClient, SyncStream};
pub use compression::{CompressionError, CompressionType, Compressor};
pub use config::{ClientConfig, Config, ConfigError, SyncConfig};
pub use manager::{HealthTrigger, SyncError, SyncManager, SyncMetricsSnapshot, SyncOutcome};
pub use model::{LogEntry, LogLevel, Metric};
pub use storage::{MemoryStorage, Storage, StorageError, StorageInfo};
