//! Configuration module for the sample forwarder.
//!
//! This module provides environment-based configuration: device identity,
//! store location and quota, overflow handling, transmission pacing and the
//! upload endpoint.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::archive::CompressionFormat;
use crate::connection::ConnectionSelection;
use crate::crypto::PublicKeySource;
use crate::overflow::OverflowChainSpec;
use crate::protocol::{Credentials, ProtocolSettings, DEFAULT_BASE_DELAY_MS};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::rate::RateBounds;
use crate::sample::local_hostname;
use crate::store::StoreQuota;
use crate::transport::{
    TransportConfig, DEFAULT_ENDPOINT_URL, DEFAULT_MAX_BATCH_SIZE, DEFAULT_MIN_BATCH_SIZE,
};

const PREFIX: &str = "SAMPLE_FORWARDER_";

/// Default store directory
const DEFAULT_STORE_DIR: &str = "./forwarder-data";

/// Default store quota (10 MiB)
const DEFAULT_MAX_STORE_BYTES: u64 = 10 * 1024 * 1024;

/// Smallest accepted store quota
const MIN_STORE_BYTES: u64 = 256;

const DEFAULT_OVERFLOW_WAIT_MS: u64 = 5_000;

const DEFAULT_OVERFLOW_DELETE_COUNT: usize = 100;

/// Upper bound for either batch size
const MAX_BATCH_SIZE_LIMIT: u64 = 100_000;

const DEFAULT_MIN_TRANSFER_INTERVAL_SECS: u64 = 60;

/// Maximum transfer interval (one day)
const MAX_TRANSFER_INTERVAL_SECS: u64 = 86_400;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const MAX_REQUEST_TIMEOUT_SECS: u64 = 600;

const DEFAULT_MAX_RETRIES: u32 = 3;

const MAX_RETRIES_LIMIT: u32 = 10;

/// Default delay between simulated samples
pub const DEFAULT_SIMULATION_INTERVAL_MS: u64 = 50;

/// Maximum delay between simulated samples (one minute)
const MAX_SIMULATION_INTERVAL_MS: u64 = 60_000;

/// Configuration for the sample forwarder.
///
/// All settings are read from `SAMPLE_FORWARDER_*` environment variables; see
/// [`Config::from_env`].
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Identifier written into every archive
    pub device_id: String,

    /// Directory holding the sample log
    pub store_dir: PathBuf,

    pub quota: StoreQuota,

    pub overflow: OverflowChainSpec,

    pub rate: RateBounds,

    pub transport: TransportConfig,

    /// Capacity of the ingestion queue
    pub queue_capacity: usize,

    /// Delay between samples produced by the simulator binary
    pub simulation_interval: Duration,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn for_var(var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(var.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `SAMPLE_FORWARDER_DEVICE_ID` | hostname |
    /// | `SAMPLE_FORWARDER_STORE_DIR` | `./forwarder-data` |
    /// | `SAMPLE_FORWARDER_MAX_STORE_BYTES` | 10 MiB |
    /// | `SAMPLE_FORWARDER_OVERFLOW_STRATEGY` | `delete` (or `stop`) |
    /// | `SAMPLE_FORWARDER_OVERFLOW_WAIT_MS` | 5000 |
    /// | `SAMPLE_FORWARDER_OVERFLOW_DELETE_COUNT` | 100 |
    /// | `SAMPLE_FORWARDER_OVERFLOW_PRIORITY_BASED` | true |
    /// | `SAMPLE_FORWARDER_ENDPOINT_URL` | `http://localhost:8000/api/v1/samples/upload` |
    /// | `SAMPLE_FORWARDER_ARCHIVE_FORMAT` | `zip` (or `jar`) |
    /// | `SAMPLE_FORWARDER_PUBLIC_KEY` / `_PUBLIC_KEY_FILE` | unset |
    /// | `SAMPLE_FORWARDER_MIN_BATCH_SIZE` / `_MAX_BATCH_SIZE` | 100 / 1000 |
    /// | `SAMPLE_FORWARDER_MIN_TRANSFER_INTERVAL_SECS` | 60 |
    /// | `SAMPLE_FORWARDER_CONNECTION` | `any` |
    /// | `SAMPLE_FORWARDER_USERNAME` / `_PASSWORD` | unset |
    /// | `SAMPLE_FORWARDER_REQUEST_TIMEOUT_SECS` | 30 |
    /// | `SAMPLE_FORWARDER_MAX_RETRIES` | 3 |
    /// | `SAMPLE_FORWARDER_SIMULATION_INTERVAL_MS` | 50 |
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a numeric or boolean variable does not parse
    /// or lies outside its allowed range. Unknown names for the overflow
    /// strategy, archive format and connection fall back to the defaults.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use sample_forwarder::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Store: {}", config.store_dir.display());
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let device_id = string_var("DEVICE_ID").unwrap_or_else(local_hostname);

        let store_dir = string_var("STORE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR));

        let max_store_bytes = parse_var("MAX_STORE_BYTES", DEFAULT_MAX_STORE_BYTES)?;
        if max_store_bytes < MIN_STORE_BYTES {
            return Err(ConfigError::for_var(
                &var_name("MAX_STORE_BYTES"),
                format!("store quota {} is below minimum ({} bytes)", max_store_bytes, MIN_STORE_BYTES),
            ));
        }

        let overflow = Self::parse_overflow()?;
        let transport = Self::parse_transport(&store_dir)?;

        let simulation_var = "SIMULATION_INTERVAL_MS";
        let simulation_ms = parse_var(simulation_var, DEFAULT_SIMULATION_INTERVAL_MS)?;
        if simulation_ms == 0 || simulation_ms > MAX_SIMULATION_INTERVAL_MS {
            return Err(ConfigError::for_var(
                &var_name(simulation_var),
                format!(
                    "simulation interval must be between 1 and {} ms",
                    MAX_SIMULATION_INTERVAL_MS
                ),
            ));
        }

        Ok(Self {
            device_id,
            store_dir,
            quota: StoreQuota::new(max_store_bytes),
            overflow,
            rate: RateBounds::default(),
            transport,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            simulation_interval: Duration::from_millis(simulation_ms),
        })
    }

    /// Parse the overflow chain selection and its parameters.
    fn parse_overflow() -> Result<OverflowChainSpec, ConfigError> {
        let wait = Duration::from_millis(parse_var("OVERFLOW_WAIT_MS", DEFAULT_OVERFLOW_WAIT_MS)?);

        let delete_count: usize = parse_var("OVERFLOW_DELETE_COUNT", DEFAULT_OVERFLOW_DELETE_COUNT)?;
        if delete_count == 0 {
            return Err(ConfigError::for_var(
                &var_name("OVERFLOW_DELETE_COUNT"),
                "delete count must be greater than 0",
            ));
        }

        let priority_based = parse_bool_var("OVERFLOW_PRIORITY_BASED", true)?;

        let strategy = string_var("OVERFLOW_STRATEGY").unwrap_or_else(|| "delete".to_string());
        let spec = match strategy.trim().to_ascii_lowercase().as_str() {
            "delete" => OverflowChainSpec::WaitDeleteNotify {
                wait,
                delete_count,
                priority_based,
            },
            "stop" => OverflowChainSpec::WaitNotifyStop { wait },
            other => {
                warn!(strategy = other, "Unknown overflow strategy, falling back to 'delete'");
                OverflowChainSpec::WaitDeleteNotify {
                    wait,
                    delete_count,
                    priority_based,
                }
            }
        };
        Ok(spec)
    }

    /// Parse the archive and upload settings.
    fn parse_transport(store_dir: &std::path::Path) -> Result<TransportConfig, ConfigError> {
        let endpoint_url = string_var("ENDPOINT_URL")
            .unwrap_or_else(|| DEFAULT_ENDPOINT_URL.to_string());

        let archive_format = match string_var("ARCHIVE_FORMAT") {
            None => CompressionFormat::Zip,
            Some(name) => CompressionFormat::from_name(&name).unwrap_or_else(|| {
                warn!(format = %name, "Unknown archive format, falling back to 'zip'");
                CompressionFormat::Zip
            }),
        };

        let public_key = match (string_var("PUBLIC_KEY"), string_var("PUBLIC_KEY_FILE")) {
            (Some(hex), _) => Some(PublicKeySource::Hex(hex)),
            (None, Some(path)) => Some(PublicKeySource::File(PathBuf::from(path))),
            (None, None) => None,
        };

        let (min_batch_size, max_batch_size) = Self::parse_batch_sizes()?;

        let interval_var = "MIN_TRANSFER_INTERVAL_SECS";
        let interval_secs = parse_var(interval_var, DEFAULT_MIN_TRANSFER_INTERVAL_SECS)?;
        if interval_secs > MAX_TRANSFER_INTERVAL_SECS {
            return Err(ConfigError::for_var(
                &var_name(interval_var),
                format!(
                    "transfer interval {} exceeds maximum ({}s)",
                    interval_secs, MAX_TRANSFER_INTERVAL_SECS
                ),
            ));
        }

        let connection = string_var("CONNECTION")
            .map(|name| ConnectionSelection::from_name(&name))
            .unwrap_or_default();

        let credentials = match (string_var("USERNAME"), string_var("PASSWORD")) {
            (Some(username), password) => Some(Credentials {
                username,
                password: password.unwrap_or_default(),
            }),
            (None, Some(_)) => {
                warn!("Password set without username, ignoring credentials");
                None
            }
            (None, None) => None,
        };

        let timeout_var = "REQUEST_TIMEOUT_SECS";
        let timeout_secs = parse_var(timeout_var, DEFAULT_REQUEST_TIMEOUT_SECS)?;
        if timeout_secs == 0 || timeout_secs > MAX_REQUEST_TIMEOUT_SECS {
            return Err(ConfigError::for_var(
                &var_name(timeout_var),
                format!(
                    "request timeout must be between 1 and {} seconds",
                    MAX_REQUEST_TIMEOUT_SECS
                ),
            ));
        }

        let retries_var = "MAX_RETRIES";
        let max_retries = parse_var(retries_var, DEFAULT_MAX_RETRIES)?;
        if max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::for_var(
                &var_name(retries_var),
                format!("max retries {} exceeds maximum ({})", max_retries, MAX_RETRIES_LIMIT),
            ));
        }

        Ok(TransportConfig {
            work_dir: store_dir.join("outbox"),
            archive_format,
            public_key,
            min_batch_size,
            max_batch_size,
            min_transfer_interval: Duration::from_secs(interval_secs),
            endpoint_url,
            connection,
            protocol: ProtocolSettings {
                request_timeout: Duration::from_secs(timeout_secs),
                max_retries,
                retry_base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
                credentials,
            },
        })
    }

    /// Parse the batch size bounds with validation.
    fn parse_batch_sizes() -> Result<(u64, u64), ConfigError> {
        let min_var = "MIN_BATCH_SIZE";
        let max_var = "MAX_BATCH_SIZE";
        let min: u64 = parse_var(min_var, DEFAULT_MIN_BATCH_SIZE)?;
        let max: u64 = parse_var(max_var, DEFAULT_MAX_BATCH_SIZE)?;

        for (var, value) in [(min_var, min), (max_var, max)] {
            if value == 0 {
                return Err(ConfigError::for_var(
                    &var_name(var),
                    "batch size must be greater than 0",
                ));
            }
            if value > MAX_BATCH_SIZE_LIMIT {
                return Err(ConfigError::for_var(
                    &var_name(var),
                    format!(
                        "batch size {} exceeds maximum allowed ({})",
                        value, MAX_BATCH_SIZE_LIMIT
                    ),
                ));
            }
        }

        if max < min {
            return Err(ConfigError::for_var(
                &var_name(max_var),
                format!("max batch size {} is below min batch size {}", max, min),
            ));
        }

        Ok((min, max))
    }
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        let store_dir = PathBuf::from(DEFAULT_STORE_DIR);
        Self {
            device_id: local_hostname(),
            transport: TransportConfig {
                work_dir: store_dir.join("outbox"),
                ..TransportConfig::default()
            },
            store_dir,
            quota: StoreQuota::new(DEFAULT_MAX_STORE_BYTES),
            overflow: OverflowChainSpec::default(),
            rate: RateBounds::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            simulation_interval: Duration::from_millis(DEFAULT_SIMULATION_INTERVAL_MS),
        }
    }
}

fn var_name(suffix: &str) -> String {
    format!("{}{}", PREFIX, suffix)
}

/// Non-empty value of a variable, if set.
fn string_var(suffix: &str) -> Option<String> {
    env::var(var_name(suffix))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: FromStr>(suffix: &str, default: T) -> Result<T, ConfigError> {
    match string_var(suffix) {
        Some(value) => value.parse().map_err(|_| {
            ConfigError::for_var(&var_name(suffix), format!("'{}' is not a valid number", value))
        }),
        None => Ok(default),
    }
}

fn parse_bool_var(suffix: &str, default: bool) -> Result<bool, ConfigError> {
    match string_var(suffix) {
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::for_var(
                &var_name(suffix),
                format!("'{}' is not a valid boolean", value),
            )),
        },
        None => Ok(default),
    }
}
