//! Configuration module
//!
//! Loads configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::store::IsolationLevel;
use crate::transfer::RetryPolicy;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Seconds to wait for a pooled connection
    pub database_acquire_timeout_secs: u64,

    /// Isolation level of every transfer scope
    pub isolation_level: IsolationLevel,

    /// Retries after a deadlock or serialization failure
    pub transfer_max_retries: u32,

    /// First backoff delay in milliseconds
    pub transfer_retry_base_delay_ms: u64,

    /// Backoff cap in milliseconds
    pub transfer_retry_max_delay_ms: u64,

    /// Per-call deadline in milliseconds (0 = none)
    pub transfer_timeout_ms: u64,

    /// Log output format
    pub log_format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::MissingEnv("DATABASE_URL"))?;

        Ok(Self {
            database_url,
            database_max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
            database_acquire_timeout_secs: parse_or(&lookup, "DATABASE_ACQUIRE_TIMEOUT_SECS", 5)?,
            isolation_level: parse_or(
                &lookup,
                "TRANSFER_ISOLATION_LEVEL",
                IsolationLevel::ReadCommitted,
            )?,
            transfer_max_retries: parse_or(&lookup, "TRANSFER_MAX_RETRIES", 3)?,
            transfer_retry_base_delay_ms: parse_or(&lookup, "TRANSFER_RETRY_BASE_DELAY_MS", 50)?,
            transfer_retry_max_delay_ms: parse_or(&lookup, "TRANSFER_RETRY_MAX_DELAY_MS", 1000)?,
            transfer_timeout_ms: parse_or(&lookup, "TRANSFER_TIMEOUT_MS", 0)?,
            log_format: parse_or(&lookup, "LOG_FORMAT", LogFormat::Pretty)?,
        })
    }

    /// Retry policy for transfer conflicts
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.transfer_max_retries,
            Duration::from_millis(self.transfer_retry_base_delay_ms),
            Duration::from_millis(self.transfer_retry_max_delay_ms),
        )
    }

    /// Service-wide deadline for one transfer call
    pub fn transfer_timeout(&self) -> Option<Duration> {
        (self.transfer_timeout_ms > 0).then(|| Duration::from_millis(self.transfer_timeout_ms))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.database_acquire_timeout_secs)
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue(key)),
        None => Ok(default),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
