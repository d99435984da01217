//! Engine configuration.
//!
//! Loaded from ~/.botfleet/config.toml (or an explicit path); every section
//! and field has a default so a missing file means a fully default engine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

// Default configuration constants
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8090;
const DEFAULT_POLL_TIMEOUT_SECS: u32 = 25;
const DEFAULT_POLL_BATCH_LIMIT: u32 = 100;
const DEFAULT_ERROR_BACKOFF_MIN_MS: u64 = 1_000;
const DEFAULT_ERROR_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 35;
const DEFAULT_TRANSITION_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;
const DEFAULT_QUEUE_BOUND: usize = 10_000;
const DEFAULT_WINDOW_SECS: u64 = 300;
const DEFAULT_ERROR_RATE_THRESHOLD: f64 = 0.1;
const DEFAULT_MIN_SAMPLES: u64 = 10;
const DEFAULT_ALERT_COOLDOWN_SECS: u64 = 900;
const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 60;
const DEFAULT_EVALUATE_INTERVAL_SECS: u64 = 30;
const DEFAULT_CLEANUP_CRON: &str = "0 0 3 * * *";
const DEFAULT_RETENTION_DAYS: u32 = 7;
const DEFAULT_SLOT_MAX_AGE_HOURS: u64 = 72;
const MAX_POLL_TIMEOUT_SECS: u32 = 50;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub server: ServerConfig,
    pub polling: PollingConfig,
    pub dispatch: DispatchConfig,
    pub health: HealthConfig,
    pub storage: StorageConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public HTTPS base URL registered with the provider, e.g.
    /// "https://bots.example.com". Required before enabling webhooks.
    pub public_base_url: Option<String>,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            public_base_url: None,
            cors_origins: Vec::new(),
        }
    }
}

/// Long-poll loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub poll_timeout_secs: u32,
    pub batch_limit: u32,
    pub error_backoff_min_ms: u64,
    pub error_backoff_max_ms: u64,
    /// How long shutdown waits for in-flight fetches before aborting.
    pub shutdown_grace_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_timeout_secs: DEFAULT_POLL_TIMEOUT_SECS,
            batch_limit: DEFAULT_POLL_BATCH_LIMIT,
            error_backoff_min_ms: DEFAULT_ERROR_BACKOFF_MIN_MS,
            error_backoff_max_ms: DEFAULT_ERROR_BACKOFF_MAX_MS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
        }
    }
}

/// Router and transition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Upper bound on provider round-trip time inside a mode transition.
    pub transition_timeout_secs: u64,
    /// Concurrent update executions across all slots (0 = cpu count * 2).
    pub max_in_flight: usize,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Queued-but-unexecuted updates across all slots before enqueue refuses.
    pub queue_bound: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            transition_timeout_secs: DEFAULT_TRANSITION_TIMEOUT_SECS,
            max_in_flight: 0,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            queue_bound: DEFAULT_QUEUE_BOUND,
        }
    }
}

impl DispatchConfig {
    /// Effective execution concurrency.
    pub fn effective_in_flight(&self) -> usize {
        if self.max_in_flight > 0 {
            self.max_in_flight
        } else {
            num_cpus::get() * 2
        }
    }
}

/// Health aggregation, thresholds, and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub window_secs: u64,
    /// Error rate above which a webhook bot falls back to polling.
    pub error_rate_threshold: f64,
    /// Minimum events in window before the threshold is considered.
    pub min_samples: u64,
    pub alert_cooldown_secs: u64,
    pub snapshot_interval_secs: u64,
    pub evaluate_interval_secs: u64,
    /// Six-field cron expression for the nightly cleanup job.
    pub cleanup_cron: String,
    pub retention_days: u32,
    pub slot_max_age_hours: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_WINDOW_SECS,
            error_rate_threshold: DEFAULT_ERROR_RATE_THRESHOLD,
            min_samples: DEFAULT_MIN_SAMPLES,
            alert_cooldown_secs: DEFAULT_ALERT_COOLDOWN_SECS,
            snapshot_interval_secs: DEFAULT_SNAPSHOT_INTERVAL_SECS,
            evaluate_interval_secs: DEFAULT_EVALUATE_INTERVAL_SECS,
            cleanup_cron: DEFAULT_CLEANUP_CRON.to_string(),
            retention_days: DEFAULT_RETENTION_DAYS,
            slot_max_age_hours: DEFAULT_SLOT_MAX_AGE_HOURS,
        }
    }
}

/// Database locations; None means the default under the data directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: Option<String>,
    pub health_db_path: Option<String>,
}

impl FleetConfig {
    /// Load from the default config path; a missing file yields defaults.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&crate::paths::config_path()?)
    }

    /// Load from a specific path; a missing file yields defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config at {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("parsing config at {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.polling.poll_timeout_secs == 0
            || self.polling.poll_timeout_secs > MAX_POLL_TIMEOUT_SECS
        {
            return Err(anyhow::anyhow!(
                "poll_timeout_secs must be between 1 and {}",
                MAX_POLL_TIMEOUT_SECS
            ));
        }
        if self.polling.error_backoff_min_ms > self.polling.error_backoff_max_ms {
            return Err(anyhow::anyhow!(
                "error_backoff_min_ms must not exceed error_backoff_max_ms"
            ));
        }
        if !(0.0..=1.0).contains(&self.health.error_rate_threshold)
            || self.health.error_rate_threshold == 0.0
        {
            return Err(anyhow::anyhow!(
                "error_rate_threshold must be within (0, 1]"
            ));
        }
        if self.health.min_samples == 0 {
            return Err(anyhow::anyhow!("min_samples must be at least 1"));
        }
        if self.dispatch.transition_timeout_secs == 0 {
            return Err(anyhow::anyhow!("transition_timeout_secs must be positive"));
        }
        Ok(())
    }

    /// The webhook URL for a bot path token, if a public base URL is set.
    pub fn webhook_url(&self, path_token: &str) -> Option<String> {
        self.server
            .public_base_url
            .as_ref()
            .map(|base| format!("{}/webhook/{}", base.trim_end_matches('/'), path_token))
    }
}
