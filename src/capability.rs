//! Device capability probing and tier classification.
//!
//! The capability snapshot is captured once at startup and never mutated
//! afterwards. It seeds the initial sync configuration (see
//! [`crate::config::SyncConfig::apply_capability_defaults`]) and is attached to
//! every sync request so the server can tailor its configuration pushes.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tracing::debug;

use crate::compression::CompressionType;

/// Disk and RAM thresholds for the full-capability tier.
const FULL_MIN_DISK_BYTES: u64 = 1_000_000_000;
const FULL_MIN_RAM_BYTES: u64 = 512_000_000;

/// Disk and RAM thresholds for the constrained tier.
const CONSTRAINED_MIN_DISK_BYTES: u64 = 10_000_000;
const CONSTRAINED_MIN_RAM_BYTES: u64 = 64_000_000;

/// Coarse classification of device capability.
///
/// Discriminants order tiers from most to least capable. On the wire a tier
/// is its lowercase name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Raspberry Pi class hosts and up
    Full = 1,
    /// ESP32 class boards with limited storage
    Constrained = 2,
    /// Tiny boards with no persistent storage
    Minimal = 3,
}

impl Tier {
    /// Classify a device from its total RAM and disk, in bytes.
    pub fn classify(total_ram: u64, total_disk: u64) -> Self {
        if total_disk > FULL_MIN_DISK_BYTES && total_ram > FULL_MIN_RAM_BYTES {
            Tier::Full
        } else if total_disk > CONSTRAINED_MIN_DISK_BYTES && total_ram > CONSTRAINED_MIN_RAM_BYTES {
            Tier::Constrained
        } else {
            Tier::Minimal
        }
    }

    /// Default sync and storage settings for this tier.
    pub fn defaults(self) -> TierDefaults {
        match self {
            Tier::Full => TierDefaults {
                sync_interval: Duration::from_secs(5 * 60),
                batch_size: 1000,
                compression_enabled: true,
                compression_type: CompressionType::Zstd,
                has_sqlite: true,
                local_storage_size: 100_000_000,
                max_metrics_in_memory: 10_000,
                supports_http2: true,
            },
            Tier::Constrained => TierDefaults {
                sync_interval: Duration::from_secs(60),
                batch_size: 100,
                compression_enabled: true,
                compression_type: CompressionType::Gzip,
                has_sqlite: true,
                local_storage_size: 5_000_000,
                max_metrics_in_memory: 1000,
                supports_http2: false,
            },
            Tier::Minimal => TierDefaults {
                sync_interval: Duration::from_secs(10),
                batch_size: 10,
                compression_enabled: false,
                compression_type: CompressionType::None,
                has_sqlite: false,
                local_storage_size: 0,
                max_metrics_in_memory: 100,
                supports_http2: false,
            },
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Full => write!(f, "full"),
            Tier::Constrained => write!(f, "constrained"),
            Tier::Minimal => write!(f, "minimal"),
        }
    }
}

/// Per-tier default table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierDefaults {
    pub sync_interval: Duration,
    pub batch_size: usize,
    pub compression_enabled: bool,
    pub compression_type: CompressionType,
    pub has_sqlite: bool,
    pub local_storage_size: u64,
    pub max_metrics_in_memory: usize,
    pub supports_http2: bool,
}

/// Immutable snapshot of what the device can do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapability {
    pub tier: Tier,
    pub total_ram: u64,
    pub available_ram: u64,
    pub total_disk: u64,
    pub available_disk: u64,
    pub cpu_cores: usize,
    pub architecture: String,
    pub os: String,

    /// Whether local storage is SQLite-backed
    pub has_sqlite: bool,

    /// Bytes of local storage allotted to the agent
    pub local_storage_size: u64,
    pub max_metrics_in_memory: usize,

    pub has_network: bool,

    /// Measured or configured uplink bandwidth, 0 when unknown
    pub bandwidth_kbps: u32,
    pub supports_http2: bool,
}

impl DeviceCapability {
    /// Probe the host for memory, disk and CPU characteristics.
    pub fn detect() -> Self {
        let mut system = System::new();
        system.refresh_memory();

        let disks = Disks::new_with_refreshed_list();
        let (total_disk, available_disk) = disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == std::path::Path::new("/"))
            .or_else(|| disks.list().first())
            .map(|disk| (disk.total_space(), disk.available_space()))
            .unwrap_or((0, 0));

        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let capability = Self::from_resources(
            system.total_memory(),
            system.available_memory(),
            total_disk,
            available_disk,
            cpu_cores,
        );

        debug!(
            tier = %capability.tier,
            total_ram = capability.total_ram,
            total_disk = capability.total_disk,
            cpu_cores = capability.cpu_cores,
            "Detected device capabilities"
        );

        capability
    }

    /// Build a snapshot from already-known resource figures.
    pub fn from_resources(
        total_ram: u64,
        available_ram: u64,
        total_disk: u64,
        available_disk: u64,
        cpu_cores: usize,
    ) -> Self {
        let tier = Tier::classify(total_ram, total_disk);
        let defaults = tier.defaults();

        Self {
            tier,
            total_ram,
            available_ram,
            total_disk,
            available_disk,
            cpu_cores,
            architecture: std::env::consts::ARCH.to_string(),
            os: std::env::consts::OS.to_string(),
            has_sqlite: defaults.has_sqlite,
            local_storage_size: defaults.local_storage_size,
            max_metrics_in_memory: defaults.max_metrics_in_memory,
            has_network: true,
            bandwidth_kbps: 0,
            supports_http2: defaults.supports_http2,
        }
    }

    /// A representative snapshot for the given tier.
    pub fn for_tier(tier: Tier) -> Self {
        let (ram, disk) = match tier {
            Tier::Full => (2_000_000_000, 32_000_000_000),
            Tier::Constrained => (128_000_000, 64_000_000),
            Tier::Minimal => (32_000_000, 0),
        };
        Self::from_resources(ram, ram / 2, disk, disk / 2, 1)
    }

    /// Override the uplink bandwidth estimate.
    pub fn with_bandwidth_kbps(mut self, kbps: u32) -> Self {
        self.bandwidth_kbps = kbps;
        self
    }

    /// Tier default table for this device.
    pub fn sync_defaults(&self) -> TierDefaults {
        self.tier.defaults()
    }
}
