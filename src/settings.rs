// Process-level settings, read from the environment (and `.env`).

use crate::core::moderation::dedup::DEFAULT_DEDUP_TTL_SECS;
use crate::core::moderation::sweeper::DEFAULT_SWEEP_INTERVAL;
use crate::core::moderation::{EngineConfig, RateLimits};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/moderation.db?mode=rwc";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key} has an invalid value '{value}'")]
    Invalid { key: &'static str, value: String },

    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub global_rate_limit: u32,
    pub per_guild_rate_limit: u32,
    pub per_user_rate_limit: u32,
    pub rate_limit_window_ms: i64,
    /// `None` disables the external scorer.
    pub scorer_api_key: Option<String>,
    pub scorer_timeout_ms: u64,
    pub sweep_interval_secs: u64,
    pub dedup_ttl_secs: i64,
    pub database_url: String,
    pub max_error_log_entries: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            global_rate_limit: 50,
            per_guild_rate_limit: 10,
            per_user_rate_limit: 3,
            rate_limit_window_ms: 60_000,
            scorer_api_key: None,
            scorer_timeout_ms: 5_000,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL.as_secs(),
            dedup_ttl_secs: DEFAULT_DEDUP_TTL_SECS,
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_error_log_entries: 50,
        }
    }
}

impl EngineSettings {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup. Unset or blank keys keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let scorer_api_key = get("SCORER_API_KEY").or_else(|| get("PERSPECTIVE_API_KEY"));

        Ok(Self {
            global_rate_limit: positive(&get, "GLOBAL_RATE_LIMIT", defaults.global_rate_limit)?,
            per_guild_rate_limit: positive(
                &get,
                "PER_GUILD_RATE_LIMIT",
                defaults.per_guild_rate_limit,
            )?,
            per_user_rate_limit: positive(
                &get,
                "PER_USER_RATE_LIMIT",
                defaults.per_user_rate_limit,
            )?,
            rate_limit_window_ms: positive(
                &get,
                "RATE_LIMIT_WINDOW_MS",
                defaults.rate_limit_window_ms,
            )?,
            scorer_api_key,
            scorer_timeout_ms: positive(&get, "SCORER_TIMEOUT_MS", defaults.scorer_timeout_ms)?,
            sweep_interval_secs: positive(
                &get,
                "SWEEP_INTERVAL_SECS",
                defaults.sweep_interval_secs,
            )?,
            dedup_ttl_secs: positive(&get, "DEDUP_TTL_SECS", defaults.dedup_ttl_secs)?,
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            max_error_log_entries: positive(
                &get,
                "MAX_ERROR_LOG_ENTRIES",
                defaults.max_error_log_entries,
            )?,
        })
    }

    pub fn scorer_timeout(&self) -> Duration {
        Duration::from_millis(self.scorer_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            rate_limits: RateLimits {
                global: self.global_rate_limit,
                per_guild: self.per_guild_rate_limit,
                per_user: self.per_user_rate_limit,
                window: chrono::Duration::milliseconds(self.rate_limit_window_ms),
            },
            collaborator_timeout: self.scorer_timeout(),
            dedup_ttl: chrono::Duration::seconds(self.dedup_ttl_secs),
            ..EngineConfig::default()
        }
    }
}

fn positive<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    let value = raw.trim().parse::<T>().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.clone(),
    })?;
    if value <= T::default() {
        return Err(ConfigError::Zero { key });
    }
    Ok(value)
}
