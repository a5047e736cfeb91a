//! Configuration for the sync agent.
//!
//! All settings can be supplied through `EDGE_SYNC_*` environment variables.
//! Sync cadence, batch size and codec may be left unset, in which case the
//! device capability tier supplies them (see
//! [`SyncConfig::apply_capability_defaults`]).

use std::env;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::capability::DeviceCapability;
use crate::compression::CompressionType;
use crate::interceptor::RetryPolicy;

/// Default sync service URL
const DEFAULT_SERVER_URL: &str = "http://localhost:8080";

const DEFAULT_ORG_ID: &str = "default";

/// Maximum allowed batch size to prevent memory issues
const MAX_BATCH_SIZE: usize = 10_000;

const MIN_INTERVAL_SECS: u64 = 1;
const MAX_INTERVAL_SECS: u64 = 86_400;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_OFFLINE_QUEUE_SIZE: usize = 10_000;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error for {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

impl ConfigError {
    fn invalid(var: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            var,
            message: message.into(),
        }
    }
}

/// Sync engine settings. Owned by the sync manager once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub device_id: String,
    pub org_id: String,
    pub server_url: String,

    /// Time between scheduled cycles; zero means "use the tier default"
    pub sync_interval: Duration,

    /// Records per cycle; zero means "use the tier default"
    pub batch_size: usize,

    pub compression_enabled: bool,

    /// `None` means "use the tier default"
    pub compression_type: Option<CompressionType>,

    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,

    /// Capacity of the offline log queue
    pub offline_queue_size: usize,

    /// Deadline for one attempt of a sync call
    pub request_timeout: Duration,

    /// Deadline for one sync call as the manager sees it, covering every
    /// client retry attempt and the backoff between them
    pub call_timeout: Duration,

    /// Outbound byte budget per second; `None` falls back to the capability
    /// bandwidth, if known
    pub bandwidth_limit: Option<u64>,

    pub circuit_failure_threshold: u32,
    pub circuit_reset_timeout: Duration,

    /// Health monitor cadence
    pub monitor_interval: Duration,

    /// Bound on the final sync during shutdown
    pub shutdown_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            org_id: DEFAULT_ORG_ID.to_string(),
            server_url: DEFAULT_SERVER_URL.to_string(),
            sync_interval: Duration::ZERO,
            batch_size: 0,
            compression_enabled: false,
            compression_type: None,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            offline_queue_size: DEFAULT_OFFLINE_QUEUE_SIZE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            call_timeout: RetryPolicy::default().budget(DEFAULT_REQUEST_TIMEOUT),
            bandwidth_limit: None,
            circuit_failure_threshold: 5,
            circuit_reset_timeout: Duration::from_secs(60),
            monitor_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// Fill every unset cadence/batch/codec field from the tier table.
    /// Explicitly configured values are kept.
    pub fn apply_capability_defaults(&mut self, capability: &DeviceCapability) {
        let defaults = capability.sync_defaults();

        if self.sync_interval.is_zero() {
            self.sync_interval = defaults.sync_interval;
        }
        if self.batch_size == 0 {
            self.batch_size = defaults.batch_size;
        }
        if self.compression_type.is_none() {
            self.compression_type = Some(defaults.compression_type);
            self.compression_enabled = defaults.compression_enabled;
        }
    }

    /// Codec actually used for outgoing batches.
    pub fn effective_compression(&self) -> CompressionType {
        if self.compression_enabled {
            self.compression_type.unwrap_or_default()
        } else {
            CompressionType::None
        }
    }
}

/// Settings for the sync service client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub server_url: String,
    pub api_key: Option<String>,

    /// Per-request timeout for unary calls
    pub request_timeout: Duration,

    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            api_key: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Full agent configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub sync: SyncConfig,
    pub client: ClientConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any variable is present but malformed or out
    /// of range, or if `EDGE_SYNC_COMPRESSION` names an unsupported codec.
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_url = env::var("EDGE_SYNC_SERVER_URL")
            .unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        if server_url.is_empty() {
            return Err(ConfigError::invalid("EDGE_SYNC_SERVER_URL", "must not be empty"));
        }

        let api_key = env::var("EDGE_SYNC_API_KEY").ok().filter(|k| !k.is_empty());
        let device_id = env::var("EDGE_SYNC_DEVICE_ID")
            .ok()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(default_device_id);
        let org_id = env::var("EDGE_SYNC_ORG_ID")
            .ok()
            .filter(|o| !o.is_empty())
            .unwrap_or_else(|| DEFAULT_ORG_ID.to_string());

        let sync_interval = parse_ranged::<u64>("EDGE_SYNC_INTERVAL_SECS", MIN_INTERVAL_SECS, MAX_INTERVAL_SECS)?
            .map(Duration::from_secs)
            .unwrap_or(Duration::ZERO);
        let batch_size = parse_ranged::<usize>("EDGE_SYNC_BATCH_SIZE", 1, MAX_BATCH_SIZE)?.unwrap_or(0);
        let compression_type = parse_compression()?;

        let max_retries = parse_ranged::<u32>("EDGE_SYNC_MAX_RETRIES", 0, 100)?.unwrap_or(DEFAULT_MAX_RETRIES);
        let initial_backoff = parse_ranged::<u64>("EDGE_SYNC_INITIAL_BACKOFF_MS", 1, 3_600_000)?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_INITIAL_BACKOFF);
        let max_backoff = parse_ranged::<u64>("EDGE_SYNC_MAX_BACKOFF_SECS", 1, MAX_INTERVAL_SECS)?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_MAX_BACKOFF);
        let backoff_multiplier = parse_multiplier()?;

        if max_backoff < initial_backoff {
            return Err(ConfigError::invalid(
                "EDGE_SYNC_MAX_BACKOFF_SECS",
                "must not be shorter than the initial backoff",
            ));
        }

        let offline_queue_size = parse_ranged::<usize>("EDGE_SYNC_OFFLINE_QUEUE_SIZE", 1, 10_000_000)?
            .unwrap_or(DEFAULT_OFFLINE_QUEUE_SIZE);
        let request_timeout = parse_ranged::<u64>("EDGE_SYNC_REQUEST_TIMEOUT_SECS", 1, 600)?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let bandwidth_limit = parse_ranged::<u64>("EDGE_SYNC_BANDWIDTH_LIMIT_BPS", 1, u64::MAX)?;

        let retry = RetryPolicy {
            max_attempts: max_retries.max(1),
            ..RetryPolicy::default()
        };

        let sync = SyncConfig {
            device_id,
            org_id,
            server_url: server_url.clone(),
            sync_interval,
            batch_size,
            compression_enabled: compression_type.is_some_and(|c| c != CompressionType::None),
            compression_type,
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
            offline_queue_size,
            request_timeout,
            call_timeout: retry.budget(request_timeout),
            bandwidth_limit,
            ..SyncConfig::default()
        };

        let client = ClientConfig {
            server_url,
            api_key,
            request_timeout,
            retry,
        };

        Ok(Self { sync, client })
    }
}

fn default_device_id() -> String {
    format!("device-{}", Uuid::new_v4())
}

/// Parse an optional numeric variable and check it against inclusive bounds.
fn parse_ranged<T>(var: &'static str, min: T, max: T) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display + Copy,
{
    let Ok(value) = env::var(var) else {
        return Ok(None);
    };

    let parsed: T = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(var, format!("'{value}' is not a valid number")))?;

    if parsed < min {
        return Err(ConfigError::invalid(var, format!("{parsed} is below minimum ({min})")));
    }
    if parsed > max {
        return Err(ConfigError::invalid(var, format!("{parsed} exceeds maximum ({max})")));
    }
    Ok(Some(parsed))
}

fn parse_multiplier() -> Result<f64, ConfigError> {
    let var = "EDGE_SYNC_BACKOFF_MULTIPLIER";
    match env::var(var) {
        Ok(value) => {
            let multiplier: f64 = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid(var, format!("'{value}' is not a valid number")))?;
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(ConfigError::invalid(var, "multiplier must be a finite number >= 1.0"));
            }
            Ok(multiplier)
        }
        Err(_) => Ok(DEFAULT_BACKOFF_MULTIPLIER),
    }
}

fn parse_compression() -> Result<Option<CompressionType>, ConfigError> {
    let var = "EDGE_SYNC_COMPRESSION";
    match env::var(var) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e: crate::compression::CompressionError| ConfigError::invalid(var, e.to_string())),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Tier;
    use parking_lot::Mutex;

    /// Tests in this module mutate the process environment.
    static ENV_LOCK: Mutex<()> = parking_lot::const_mutex(());

    const ALL_VARS: &[&str] = &[
        "EDGE_SYNC_SERVER_URL",
        "EDGE_SYNC_API_KEY",
        "EDGE_SYNC_DEVICE_ID",
        "EDGE_SYNC_ORG_ID",
        "EDGE_SYNC_INTERVAL_SECS",
        "EDGE_SYNC_BATCH_SIZE",
        "EDGE_SYNC_COMPRESSION",
        "EDGE_SYNC_MAX_RETRIES",
        "EDGE_SYNC_INITIAL_BACKOFF_MS",
        "EDGE_SYNC_MAX_BACKOFF_SECS",
        "EDGE_SYNC_BACKOFF_MULTIPLIER",
        "EDGE_SYNC_OFFLINE_QUEUE_SIZE",
        "EDGE_SYNC_REQUEST_TIMEOUT_SECS",
        "EDGE_SYNC_BANDWIDTH_LIMIT_BPS",
    ];

    // Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }

        fn remove(key: &str) -> Self {
            let original = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    fn clean_env() -> Vec<EnvGuard> {
        ALL_VARS.iter().map(|var| EnvGuard::remove(var)).collect()
    }

    fn expect_invalid(result: Result<Config, ConfigError>, var_name: &str, fragment: &str) {
        match result {
            Err(ConfigError::Invalid { var, message }) => {
                assert_eq!(var, var_name);
                assert!(message.contains(fragment), "message: {message}");
            }
            Ok(config) => panic!("expected invalid {var_name}, got {config:?}"),
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.client.server_url, "http://localhost:8080");
        assert!(config.sync.device_id.starts_with("device-"));
        assert_eq!(config.sync.org_id, "default");
        assert_eq!(config.sync.batch_size, 0);
        assert_eq!(config.sync.max_backoff, Duration::from_secs(60));
        assert_eq!(config.sync.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_LOCK.lock();
        let _guards = clean_env();

        let config = Config::from_env().expect("Should load with defaults");
        assert_eq!(config.sync.server_url, "http://localhost:8080");
        assert!(config.sync.sync_interval.is_zero());
        assert!(config.sync.compression_type.is_none());
        assert!(config.client.api_key.is_none());
        assert_eq!(config.client.retry.max_attempts, 3);
        assert_eq!(config.sync.call_timeout, Duration::from_millis(93_750));
    }

    #[test]
    fn test_config_from_env_custom_values() {
        let _lock = ENV_LOCK.lock();
        let _guards = clean_env();
        let _g1 = EnvGuard::set("EDGE_SYNC_SERVER_URL", "http://custom:9000/");
        let _g2 = EnvGuard::set("EDGE_SYNC_BATCH_SIZE", "200");
        let _g3 = EnvGuard::set("EDGE_SYNC_INTERVAL_SECS", "10");
        let _g4 = EnvGuard::set("EDGE_SYNC_COMPRESSION", "gzip");
        let _g5 = EnvGuard::set("EDGE_SYNC_DEVICE_ID", "pi-42");
        let _g6 = EnvGuard::set("EDGE_SYNC_API_KEY", "secret");
        let _g7 = EnvGuard::set("EDGE_SYNC_BANDWIDTH_LIMIT_BPS", "4096");

        let config = Config::from_env().expect("Should load custom values");
        assert_eq!(config.client.server_url, "http://custom:9000"); // Trailing slash removed
        assert_eq!(config.sync.batch_size, 200);
        assert_eq!(config.sync.sync_interval, Duration::from_secs(10));
        assert_eq!(config.sync.compression_type, Some(CompressionType::Gzip));
        assert!(config.sync.compression_enabled);
        assert_eq!(config.sync.device_id, "pi-42");
        assert_eq!(config.client.api_key.as_deref(), Some("secret"));
        assert_eq!(config.sync.bandwidth_limit, Some(4096));
    }

    #[test]
    fn test_invalid_batch_size() {
        let _lock = ENV_LOCK.lock();
        let _guards = clean_env();

        let _guard = EnvGuard::set("EDGE_SYNC_BATCH_SIZE", "not_a_number");
        expect_invalid(Config::from_env(), "EDGE_SYNC_BATCH_SIZE", "not a valid number");

        let _guard = EnvGuard::set("EDGE_SYNC_BATCH_SIZE", "0");
        expect_invalid(Config::from_env(), "EDGE_SYNC_BATCH_SIZE", "below minimum");

        let _guard = EnvGuard::set("EDGE_SYNC_BATCH_SIZE", "99999");
        expect_invalid(Config::from_env(), "EDGE_SYNC_BATCH_SIZE", "exceeds maximum");
    }

    #[test]
    fn test_interval_bounds() {
        let _lock = ENV_LOCK.lock();
        let _guards = clean_env();

        let _guard = EnvGuard::set("EDGE_SYNC_INTERVAL_SECS", "0");
        expect_invalid(Config::from_env(), "EDGE_SYNC_INTERVAL_SECS", "below minimum");

        let _guard = EnvGuard::set("EDGE_SYNC_INTERVAL_SECS", "100000");
        expect_invalid(Config::from_env(), "EDGE_SYNC_INTERVAL_SECS", "exceeds maximum");
    }

    #[test]
    fn test_unsupported_compression_fails_fast() {
        let _lock = ENV_LOCK.lock();
        let _guards = clean_env();
        let _guard = EnvGuard::set("EDGE_SYNC_COMPRESSION", "brotli");

        expect_invalid(Config::from_env(), "EDGE_SYNC_COMPRESSION", "brotli");
    }

    #[test]
    fn test_backoff_bounds_are_consistent() {
        let _lock = ENV_LOCK.lock();
        let _guards = clean_env();
        let _g1 = EnvGuard::set("EDGE_SYNC_INITIAL_BACKOFF_MS", "5000");
        let _g2 = EnvGuard::set("EDGE_SYNC_MAX_BACKOFF_SECS", "2");

        expect_invalid(Config::from_env(), "EDGE_SYNC_MAX_BACKOFF_SECS", "shorter");

        let _g3 = EnvGuard::set("EDGE_SYNC_MAX_BACKOFF_SECS", "60");
        let _g4 = EnvGuard::set("EDGE_SYNC_BACKOFF_MULTIPLIER", "0.5");
        expect_invalid(Config::from_env(), "EDGE_SYNC_BACKOFF_MULTIPLIER", ">= 1.0");
    }

    #[test]
    fn test_capability_defaults_fill_unset_fields() {
        let mut config = SyncConfig::default();
        config.apply_capability_defaults(&DeviceCapability::for_tier(Tier::Constrained));

        assert_eq!(config.sync_interval, Duration::from_secs(60));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.compression_type, Some(CompressionType::Gzip));
        assert!(config.compression_enabled);
        assert_eq!(config.effective_compression(), CompressionType::Gzip);
    }

    #[test]
    fn test_explicit_values_win_over_capability_defaults() {
        let mut config = SyncConfig {
            sync_interval: Duration::from_secs(7),
            batch_size: 3,
            compression_type: Some(CompressionType::None),
            ..SyncConfig::default()
        };
        config.apply_capability_defaults(&DeviceCapability::for_tier(Tier::Full));

        assert_eq!(config.sync_interval, Duration::from_secs(7));
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.effective_compression(), CompressionType::None);
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::invalid("TEST_VAR", "test error");
        assert_eq!(error.to_string(), "configuration error for TEST_VAR: test error");
    }
}
