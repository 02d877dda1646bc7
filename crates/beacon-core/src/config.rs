//! Configuration management for the SDK.

use crate::{ConsentConfiguration, CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default single-event collect endpoint.
pub const DEFAULT_COLLECT_URL: &str = "https://collect.beacon.dev/event";

/// Default bulk collect endpoint.
pub const DEFAULT_COLLECT_BATCH_URL: &str = "https://collect.beacon.dev/bulk-event";

/// The bulk endpoint accepts at most this many events per request.
pub const MAX_COLLECT_BATCH_SIZE: usize = 10;

/// Main SDK configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Account every event is reported under.
    #[serde(default)]
    pub account: String,
    /// Profile every event is reported under.
    #[serde(default)]
    pub profile: String,
    /// Database location; defaults to [`Paths::database_file`].
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub collect: CollectConfig,
    #[serde(default)]
    pub consent: ConsentSettings,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            account: String::new(),
            profile: String::new(),
            database_path: None,
            queue: QueueConfig::default(),
            connectivity: ConnectivityConfig::default(),
            retry: RetryConfig::default(),
            dispatch: DispatchConfig::default(),
            collect: CollectConfig::default(),
            consent: ConsentSettings::default(),
        }
    }
}

/// Queue depth and age limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of undelivered dispatches; negative disables eviction.
    pub max_size: i64,
    /// Dispatches older than this are never delivered.
    pub expiration_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            expiration_secs: 86_400,
        }
    }
}

impl QueueConfig {
    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.expiration_secs)
    }
}

/// Empirical connectivity tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Backoff for the first failure timeout.
    pub backoff_base_ms: u64,
    /// Backoff cap.
    pub backoff_max_ms: u64,
    /// Settle time for OS reachability flaps (0 = apply immediately).
    pub monitor_debounce_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 2_000,
            backoff_max_ms: 120_000,
            monitor_debounce_ms: 500,
        }
    }
}

/// Retry policy tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// When set, retryable failures with connectivity available retry after this delay.
    pub fixed_delay_ms: Option<u64>,
}

impl RetryConfig {
    pub fn fixed_delay(&self) -> Option<Duration> {
        self.fixed_delay_ms.map(Duration::from_millis)
    }
}

/// Scheduling loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Interval between periodic drains of each processor.
    pub drain_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            drain_interval_ms: 30_000,
        }
    }
}

impl DispatchConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms.max(1))
    }
}

/// Collect endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectConfig {
    pub enabled: bool,
    pub url: String,
    pub batch_url: String,
    /// Replaces the profile of every outgoing event when set.
    pub profile_override: Option<String>,
    /// Events per bulk request, capped at [`MAX_COLLECT_BATCH_SIZE`].
    pub batch_size: usize,
    pub timeout_secs: u64,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: DEFAULT_COLLECT_URL.to_string(),
            batch_url: DEFAULT_COLLECT_BATCH_URL.to_string(),
            profile_override: None,
            batch_size: MAX_COLLECT_BATCH_SIZE,
            timeout_secs: 30,
        }
    }
}

impl CollectConfig {
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_COLLECT_BATCH_SIZE)
    }

    /// Parse and validate both endpoints.
    pub fn endpoints(&self) -> CoreResult<(Url, Url)> {
        let parse = |field: &'static str, raw: &str| {
            Url::parse(raw).map_err(|source| CoreError::InvalidEndpoint { field, source })
        };
        Ok((parse("url", &self.url)?, parse("batch_url", &self.batch_url)?))
    }
}

/// Consent gating settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsentSettings {
    /// When false, events bypass the consent gate entirely.
    pub enabled: bool,
    /// Required when `enabled` is true.
    pub configuration: Option<ConsentConfiguration>,
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the config file, falling back to defaults.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the config file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> CoreResult<()> {
        if self.collect.enabled {
            self.collect.endpoints()?;
        }
        if self.consent.enabled && self.consent.configuration.is_none() {
            return Err(CoreError::Config(
                "consent is enabled but no consent configuration is set".to_string(),
            ));
        }
        Ok(())
    }

    /// Database file, honouring an explicit override.
    pub fn database_file(&self, paths: &Paths) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| paths.database_file())
    }

    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var("BEACON_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Some(max_size) = std::env::var("BEACON_QUEUE_MAX_SIZE")
            .ok()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
        {
            self.queue.max_size = max_size;
        }
    }
}
