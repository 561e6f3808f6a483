//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::consistency::Severity;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_name")]
    pub name: String,
    #[serde(default = "default_server_version")]
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            version: default_server_version(),
        }
    }
}

/// Which key-value backend the storage layer talks to
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Redis,
    /// Process-local store, nothing survives a restart
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
}

impl RedisConfig {
    /// Connection URL in the `redis://` scheme
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) if !password.is_empty() => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            password: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            socket_timeout_ms: default_socket_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_retry_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
        }
    }
}

/// Adverse price movement level, as a fraction of the entry price
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PriceThreshold {
    pub percent: f64,
    pub severity: Severity,
    pub message: String,
}

/// Consistency rule parameters
#[derive(Debug, Clone, Deserialize)]
pub struct RulesConfig {
    /// Minimum minutes a bias must be held before it may change
    #[serde(default = "default_holding_period_minutes")]
    pub holding_period_minutes: i64,
    /// Bias changes allowed inside the lookback window (normal market)
    #[serde(default = "default_reversal_max_changes")]
    pub reversal_max_changes: usize,
    #[serde(default = "default_reversal_lookback_minutes")]
    pub reversal_lookback_minutes: i64,
    /// Tolerance applied around the invalidation level (0.05 = 5%)
    #[serde(default = "default_invalidation_buffer_pct")]
    pub invalidation_buffer_pct: f64,
    #[serde(default = "default_adverse_thresholds")]
    pub adverse_thresholds: Vec<PriceThreshold>,
    /// Recent decisions scanned for a matching position entry
    #[serde(default = "default_adverse_lookback_decisions")]
    pub adverse_lookback_decisions: usize,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            holding_period_minutes: default_holding_period_minutes(),
            reversal_max_changes: default_reversal_max_changes(),
            reversal_lookback_minutes: default_reversal_lookback_minutes(),
            invalidation_buffer_pct: default_invalidation_buffer_pct(),
            adverse_thresholds: default_adverse_thresholds(),
            adverse_lookback_decisions: default_adverse_lookback_decisions(),
        }
    }
}

/// Key retention and list caps
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_bias_ttl_secs")]
    pub bias_ttl_secs: u64,
    #[serde(default = "default_decision_ttl_secs")]
    pub decision_ttl_secs: u64,
    #[serde(default = "default_changes_ttl_secs")]
    pub changes_ttl_secs: u64,
    #[serde(default = "default_position_ttl_secs")]
    pub position_ttl_secs: u64,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_position_limit")]
    pub position_limit: usize,
    #[serde(default = "default_decision_limit")]
    pub decision_limit: usize,
}

impl StorageConfig {
    pub fn bias_ttl(&self) -> Duration {
        Duration::from_secs(self.bias_ttl_secs)
    }

    pub fn decision_ttl(&self) -> Duration {
        Duration::from_secs(self.decision_ttl_secs)
    }

    pub fn changes_ttl(&self) -> Duration {
        Duration::from_secs(self.changes_ttl_secs)
    }

    pub fn position_ttl(&self) -> Duration {
        Duration::from_secs(self.position_ttl_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            bias_ttl_secs: default_bias_ttl_secs(),
            decision_ttl_secs: default_decision_ttl_secs(),
            changes_ttl_secs: default_changes_ttl_secs(),
            position_ttl_secs: default_position_ttl_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            history_limit: default_history_limit(),
            position_limit: default_position_limit(),
            decision_limit: default_decision_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value functions
fn default_server_name() -> String {
    "trading-memory".to_string()
}

fn default_server_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_socket_timeout_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_holding_period_minutes() -> i64 {
    3
}

fn default_reversal_max_changes() -> usize {
    2
}

fn default_reversal_lookback_minutes() -> i64 {
    60
}

fn default_invalidation_buffer_pct() -> f64 {
    0.05
}

fn default_adverse_thresholds() -> Vec<PriceThreshold> {
    vec![
        PriceThreshold {
            percent: 0.05,
            severity: Severity::Warning,
            message: "5% adverse move - consider reducing position".to_string(),
        },
        PriceThreshold {
            percent: 0.10,
            severity: Severity::High,
            message: "10% adverse move - bias likely invalid".to_string(),
        },
        PriceThreshold {
            percent: 0.20,
            severity: Severity::Critical,
            message: "20% adverse move - stop loss triggered".to_string(),
        },
    ]
}

fn default_adverse_lookback_decisions() -> usize {
    10
}

fn default_bias_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_decision_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_changes_ttl_secs() -> u64 {
    3 * 24 * 60 * 60
}

fn default_position_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_session_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_history_limit() -> usize {
    100
}

fn default_position_limit() -> usize {
    20
}

fn default_decision_limit() -> usize {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix TRADING_MEMORY__)
            .add_source(
                config::Environment::with_prefix("TRADING_MEMORY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.server.name.trim().is_empty() {
            anyhow::bail!("server.name cannot be empty");
        }

        if self.storage.backend == BackendKind::Redis {
            if self.redis.host.trim().is_empty() {
                anyhow::bail!("redis.host cannot be empty");
            }
            if self.redis.port == 0 {
                anyhow::bail!("redis.port must be between 1 and 65535");
            }
        }

        if self.retry.backoff_factor < 1.0 {
            anyhow::bail!("retry.backoff_factor must be at least 1.0");
        }

        if self.health.interval_secs == 0 {
            anyhow::bail!("health.interval_secs must be positive");
        }

        // Rule thresholds
        if self.rules.holding_period_minutes < 1 {
            anyhow::bail!("rules.holding_period_minutes must be at least 1");
        }

        if self.rules.reversal_max_changes < 1 {
            anyhow::bail!("rules.reversal_max_changes must be at least 1");
        }

        if self.rules.reversal_lookback_minutes < 1 {
            anyhow::bail!("rules.reversal_lookback_minutes must be at least 1");
        }

        if !(0.0..1.0).contains(&self.rules.invalidation_buffer_pct) {
            anyhow::bail!("rules.invalidation_buffer_pct must be in [0, 1)");
        }

        let mut previous = 0.0;
        for threshold in &self.rules.adverse_thresholds {
            if threshold.percent <= previous {
                anyhow::bail!(
                    "rules.adverse_thresholds must be positive and ascending, got {} after {}",
                    threshold.percent,
                    previous
                );
            }
            previous = threshold.percent;
        }

        // Storage caps
        if self.storage.history_limit == 0
            || self.storage.position_limit == 0
            || self.storage.decision_limit == 0
        {
            anyhow::bail!("storage list limits must be positive");
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Server:
    name: {}
    version: {}
  Storage:
    backend: {:?}
    redis: {}
    socket_timeout: {}ms
    ttl (bias/decisions/changes/positions/session): {}s/{}s/{}s/{}s/{}s
    limits (history/positions/decisions): {}/{}/{}
  Retry:
    max_retries: {}
    base_delay: {}ms
    backoff_factor: {}
  Health:
    interval: {}s
  Rules:
    holding_period: {} min
    reversal: max {} changes per {} min
    invalidation_buffer: {}%
    adverse_thresholds: {:?}
"#,
            self.server.name,
            self.server.version,
            self.storage.backend,
            mask_url(&self.redis.url()),
            self.redis.socket_timeout_ms,
            self.storage.bias_ttl_secs,
            self.storage.decision_ttl_secs,
            self.storage.changes_ttl_secs,
            self.storage.position_ttl_secs,
            self.storage.session_ttl_secs,
            self.storage.history_limit,
            self.storage.position_limit,
            self.storage.decision_limit,
            self.retry.max_retries,
            self.retry.base_delay_ms,
            self.retry.backoff_factor,
            self.health.interval_secs,
            self.rules.holding_period_minutes,
            self.rules.reversal_max_changes,
            self.rules.reversal_lookback_minutes,
            self.rules.invalidation_buffer_pct * 100.0,
            self.rules
                .adverse_thresholds
                .iter()
                .map(|t| t.percent)
                .collect::<Vec<_>>(),
        )
    }
}

/// Mask URL for display (hide the password component)
fn mask_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
