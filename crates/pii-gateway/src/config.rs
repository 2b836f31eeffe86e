//! Service configuration

use pii_breaker::BreakerConfig;
use pii_rules::Category;
use pii_scanner::ScannerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "PII_GATEWAY_CONFIG";
/// Environment variable overriding `listen_addr`
pub const BIND_ENV: &str = "PII_GATEWAY_BIND";
/// Config path used when the environment does not name one
pub const DEFAULT_CONFIG_PATH: &str = "/etc/pii-gateway/config.json";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("reading {path}: {source}")]
    Io {
        /// Config path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// File is not valid configuration JSON
    #[error("parsing {path}: {source}")]
    Parse {
        /// Config path
        path: PathBuf,
        /// Underlying error
        source: serde_json::Error,
    },
    /// Values are inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP listen address
    pub listen_addr: SocketAddr,
    /// Rule bundle file loaded at startup and polled for changes
    pub bundle_path: Option<PathBuf>,
    /// Bundle file poll interval
    pub bundle_poll_interval_ms: u64,
    /// Activate the built-in default bundle when no bundle file is set
    pub builtin_bundle: bool,
    /// Per-category enable toggles (missing = enabled)
    pub categories: HashMap<Category, bool>,
    /// Scan limits and scanner tuning
    pub scanner: ScanSettings,
    /// Worker pool and queue
    pub admission: AdmissionConfig,
    /// Breaker thresholds
    pub breaker: BreakerConfig,
    /// Metrics and sampling
    pub metrics: MetricsConfig,
    /// Rule store
    pub store: StoreConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            bundle_path: None,
            bundle_poll_interval_ms: 2_000,
            builtin_bundle: true,
            categories: HashMap::new(),
            scanner: ScanSettings::default(),
            admission: AdmissionConfig::default(),
            breaker: BreakerConfig::default(),
            metrics: MetricsConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Request limits around the scanner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Largest accepted payload
    pub max_payload_bytes: usize,
    /// Deadline when the caller sends none
    pub default_deadline_ms: u64,
    /// Upper bound on caller deadlines
    pub max_deadline_ms: u64,
    /// Slice of the budget held back from the scanner so the backstop can
    /// fail closed by the caller's deadline
    pub backstop_grace_ms: u64,
    /// Scanner engine settings
    #[serde(flatten)]
    pub engine: ScannerConfig,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            max_payload_bytes: 256 * 1024,
            default_deadline_ms: 10,
            max_deadline_ms: 100,
            backstop_grace_ms: 5,
            engine: ScannerConfig::default(),
        }
    }
}

impl ScanSettings {
    /// Effective budget for a caller-supplied deadline
    pub fn deadline(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(self.default_deadline_ms)
            .min(self.max_deadline_ms);
        Duration::from_millis(ms)
    }

    /// Backstop grace
    pub fn backstop_grace(&self) -> Duration {
        Duration::from_millis(self.backstop_grace_ms)
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Concurrent scans
    pub workers: usize,
    /// Requests allowed to wait for a worker
    pub queue_depth: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            queue_depth: 64,
        }
    }
}

/// Metrics and false-positive sampling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Reservoir size
    pub sample_capacity: usize,
    /// Probability an eligible event is sampled
    pub sample_rate: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_capacity: 256,
            sample_rate: 0.05,
        }
    }
}

/// Rule store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How long a replaced ruleset stays reachable
    pub grace_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { grace_ms: 30_000 }
    }
}

impl ServiceConfig {
    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve from the environment: file named by `PII_GATEWAY_CONFIG`
    /// (defaults on any failure) and `PII_GATEWAY_BIND` override
    pub fn from_env() -> Self {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "config not loaded, using defaults");
            Self::default()
        });

        if let Ok(bind) = std::env::var(BIND_ENV) {
            match bind.parse() {
                Ok(addr) => config.listen_addr = addr,
                Err(e) => tracing::warn!(%bind, error = %e, "ignoring invalid bind address"),
            }
        }
        config
    }

    /// Reject inconsistent values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admission.workers == 0 {
            return Err(ConfigError::Invalid("admission.workers must be at least 1".into()));
        }
        if self.scanner.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid("scanner.max_payload_bytes must be positive".into()));
        }
        if self.scanner.default_deadline_ms > self.scanner.max_deadline_ms {
            return Err(ConfigError::Invalid(
                "scanner.default_deadline_ms exceeds scanner.max_deadline_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.scanner.engine.deadline_reserve_ratio) {
            return Err(ConfigError::Invalid(
                "scanner.deadline_reserve_ratio must be within 0..=1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.metrics.sample_rate) {
            return Err(ConfigError::Invalid("metrics.sample_rate must be within 0..=1".into()));
        }
        Ok(())
    }

    /// Bundle poll interval
    pub fn bundle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.bundle_poll_interval_ms.max(100))
    }
}
