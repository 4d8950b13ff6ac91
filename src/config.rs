// config.rs - Engine configuration with environment overrides

use serde::{Deserialize, Serialize};

/// Tunable parameters for the sync engine.
///
/// Defaults match the documented behavior; every field can be overridden
/// via a `SYNCBRIDGE_`-prefixed environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// First retry delay in milliseconds; doubles on each attempt.
    pub base_retry_delay_ms: u64,
    /// Upper bound on the computed retry delay.
    pub max_retry_delay_ms: u64,
    /// Attempts before a request is marked failed.
    pub max_retries: i32,
    /// Period of the drain tick.
    pub tick_interval_ms: u64,
    /// Maximum ready entries pulled per drain.
    pub batch_size: i64,
    /// Upper bound on the safe-shutdown wait for an in-flight drain.
    pub safe_shutdown_timeout_ms: u64,
    /// Age threshold for the retention sweep.
    pub sweep_age_days: i64,
    /// Informational base URL of the remote service; each queued request
    /// carries its own absolute or pre-resolved URL.
    pub remote_base_url: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 300_000,
            max_retries: 3,
            tick_interval_ms: 5_000,
            batch_size: 10,
            safe_shutdown_timeout_ms: 10_000,
            sweep_age_days: 7,
            remote_base_url: None,
        }
    }
}

impl SyncConfig {
    /// Build a config from the environment, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            base_retry_delay_ms: env_parse("SYNCBRIDGE_BASE_RETRY_DELAY_MS")
                .unwrap_or(defaults.base_retry_delay_ms),
            max_retry_delay_ms: env_parse("SYNCBRIDGE_MAX_RETRY_DELAY_MS")
                .unwrap_or(defaults.max_retry_delay_ms),
            max_retries: env_parse("SYNCBRIDGE_MAX_RETRIES").unwrap_or(defaults.max_retries),
            tick_interval_ms: env_parse("SYNCBRIDGE_TICK_INTERVAL_MS")
                .unwrap_or(defaults.tick_interval_ms),
            batch_size: env_parse("SYNCBRIDGE_BATCH_SIZE").unwrap_or(defaults.batch_size),
            safe_shutdown_timeout_ms: env_parse("SYNCBRIDGE_SAFE_SHUTDOWN_TIMEOUT_MS")
                .unwrap_or(defaults.safe_shutdown_timeout_ms),
            sweep_age_days: env_parse("SYNCBRIDGE_SWEEP_AGE_DAYS")
                .unwrap_or(defaults.sweep_age_days),
            remote_base_url: std::env::var("SYNCBRIDGE_REMOTE_BASE_URL").ok(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
