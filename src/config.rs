use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// PostgreSQL connection URL for transactions and pots
    pub postgres_url: String,
    /// Redis URL for the callback queue, rate limiter and notifications
    #[serde(default)]
    pub redis_url: Option<String>,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// Banking provider REST API
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_provider_timeout_ms() -> u64 {
    15_000
}

/// Status callback consumer
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConsumerConfig {
    pub queue_key: String,
    pub processing_key: String,
    pub workers: usize,
    pub receive_timeout_ms: u64,
    /// Redeliveries of an event whose transaction cannot be found before it is dropped
    pub max_missing_attempts: u32,
    pub backoff_step_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue_key: "provider:callbacks".to_string(),
            processing_key: "provider:callbacks:processing".to_string(),
            workers: 4,
            receive_timeout_ms: 5_000,
            max_missing_attempts: 20,
            backoff_step_ms: 250,
            backoff_cap_ms: 3_000,
        }
    }
}

impl ConsumerConfig {
    /// Linear backoff for the given missing-transaction attempt
    pub fn missing_backoff(&self, attempt: u32) -> Duration {
        let delay = self.backoff_step_ms.saturating_mul(u64::from(attempt));
        Duration::from_millis(delay.min(self.backoff_cap_ms))
    }
}

/// Claim reconciliation sweep
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_secs: u64,
    /// Claims younger than this are left to the live callback path
    pub min_age_secs: u64,
    pub batch_size: i64,
    /// Upper bound for one sweep run
    pub max_duration_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            min_age_secs: 300,
            batch_size: 50,
            max_duration_secs: 120,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub prefix: String,
    /// Claims per claimant per window; 0 disables limiting
    pub claim_limit: u64,
    pub claim_window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            prefix: "ratelimit".to_string(),
            claim_limit: 5,
            claim_window_ms: 60_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NotificationConfig {
    /// Redis pub/sub channel; notifications are only logged when Redis is not configured
    pub channel: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channel: "notifications".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }
}
