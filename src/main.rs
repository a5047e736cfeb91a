//! Edge Sync Agent
//!
//! Collects sample sensor telemetry into local storage and ships it to the
//! sync server in batches sized for the device.
//!
//! ## Configuration
//!
//! Loaded from `EDGE_SYNC_*` environment variables, see [`Config::from_env`].
//! `RUST_LOG` controls the log filter (default: info).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use edge_sync::capability::DeviceCapability;
use edge_sync::client::{RpcSyncClient, SyncClient};
use edge_sync::config::Config;
use edge_sync::generator::MetricGenerator;
use edge_sync::manager::SyncManager;
use edge_sync::model::LogLevel;
use edge_sync::storage::{MemoryStorage, Storage};

/// How often a sweep of sensor readings is collected
const COLLECT_INTERVAL: Duration = Duration::from_secs(1);

/// How often a status snapshot is logged
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting Edge Sync Agent...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                server_url = %config.client.server_url,
                device_id = %config.sync.device_id,
                org_id = %config.sync.org_id,
                max_retries = config.sync.max_retries,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let capability = DeviceCapability::detect();
    info!(
        tier = %capability.tier,
        total_ram = capability.total_ram,
        total_disk = capability.total_disk,
        cpu_cores = capability.cpu_cores,
        "Device capability detected"
    );

    let storage = Arc::new(MemoryStorage::new(capability.max_metrics_in_memory));

    let client = match RpcSyncClient::new(&config.client) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "Failed to create sync client");
            std::process::exit(1);
        }
    };

    let device_id = config.sync.device_id.clone();
    let manager = SyncManager::new(storage.clone(), client.clone(), capability, config.sync);
    if let Err(e) = manager.start() {
        error!(error = %e, "Failed to start sync manager");
        std::process::exit(1);
    }

    let generator = MetricGenerator::with_defaults(device_id);
    let collector = tokio::spawn(run_collector(generator, storage.clone(), manager.clone()));
    let status = tokio::spawn(report_status(manager.clone(), storage.clone()));

    info!("Edge Sync Agent running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping..."),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    collector.abort();
    status.abort();

    manager.stop().await;
    client.close();
    storage.close();

    let snapshot = manager.get_metrics();
    info!(
        metrics_synced = snapshot.metrics_synced,
        logs_synced = snapshot.logs_synced,
        successful_syncs = snapshot.successful_syncs,
        failed_syncs = snapshot.failed_syncs,
        "Edge Sync Agent stopped"
    );
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Store one sweep of readings per tick. Readings worth a log line are also
/// queued for log sync.
async fn run_collector(generator: MetricGenerator, storage: Arc<MemoryStorage>, manager: SyncManager) {
    let mut ticker = interval(COLLECT_INTERVAL);

    loop {
        ticker.tick().await;

        for metric in generator.sweep() {
            let entry = generator.describe(&metric);
            if let Err(e) = storage.store_metric(metric) {
                warn!(error = %e, "Failed to store metric, collector stopping");
                return;
            }
            if matches!(entry.level, LogLevel::Warn | LogLevel::Error | LogLevel::Fatal) {
                if let Err(e) = manager.record_log(entry) {
                    warn!(error = %e, "Failed to queue log entry");
                }
            }
        }
    }
}

async fn report_status(manager: SyncManager, storage: Arc<MemoryStorage>) {
    let mut ticker = interval(STATUS_INTERVAL);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let snapshot = manager.get_metrics();
        let info = storage.storage_info();
        info!(
            metrics_synced = snapshot.metrics_synced,
            logs_synced = snapshot.logs_synced,
            bytes_sent = snapshot.bytes_sent,
            compression_ratio = format!("{:.2}", snapshot.compression_ratio),
            successful_syncs = snapshot.successful_syncs,
            failed_syncs = snapshot.failed_syncs,
            consecutive_failures = snapshot.consecutive_failures,
            circuit = %snapshot.circuit_state,
            unsynced = info.unsynced_metrics,
            dropped = storage.dropped(),
            "Sync status"
        );
    }
}
