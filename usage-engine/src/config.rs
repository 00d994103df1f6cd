//! Runtime configuration for the usage engine.

use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::services::MAX_BATCH_SIZE;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub common: core_config::Config,
    pub database: DatabaseConfig,
    pub analytics: AnalyticsConfig,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Tunables for writing and querying usage facts.
#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub write_batch_size: usize,
    pub default_lookback_days: i64,
    pub recent_lookback_hours: i64,
    /// Zero disables the background rollup refresh.
    pub rollup_refresh_secs: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            write_batch_size: MAX_BATCH_SIZE,
            default_lookback_days: 30,
            recent_lookback_hours: 6,
            rollup_refresh_secs: 300,
        }
    }
}

impl AnalyticsConfig {
    pub fn default_lookback(&self) -> chrono::Duration {
        chrono::Duration::days(self.default_lookback_days)
    }

    pub fn recent_lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(self.recent_lookback_hours)
    }

    pub fn rollup_refresh_interval(&self) -> Option<Duration> {
        (self.rollup_refresh_secs > 0).then(|| Duration::from_secs(self.rollup_refresh_secs))
    }
}

impl EngineConfig {
    pub fn load() -> Result<Self, AppError> {
        // Common config handles .env and the APP__ prefix.
        let common = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";
        let defaults = AnalyticsConfig::default();

        Ok(EngineConfig {
            common,
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 2)?,
            },
            analytics: AnalyticsConfig {
                write_batch_size: parse_env("USAGE_WRITE_BATCH_SIZE", defaults.write_batch_size)?,
                default_lookback_days: parse_env(
                    "USAGE_DEFAULT_LOOKBACK_DAYS",
                    defaults.default_lookback_days,
                )?,
                recent_lookback_hours: parse_env(
                    "USAGE_RECENT_LOOKBACK_HOURS",
                    defaults.recent_lookback_hours,
                )?,
                rollup_refresh_secs: parse_env(
                    "USAGE_ROLLUP_REFRESH_SECS",
                    defaults.rollup_refresh_secs,
                )?,
            },
            service_name: get_env("SERVICE_NAME", Some("usage-engine"), false)?,
            log_level: get_env("LOG_LEVEL", Some("info"), false)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
        })
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value {:?}: {}", key, raw, e))
        }),
        Err(_) => Ok(default),
    }
}
