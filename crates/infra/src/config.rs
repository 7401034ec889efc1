//! Configuration loading and representation.
//!
//! Everything comes from environment variables with development defaults.
//! Malformed values are rejected at startup instead of silently defaulted.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use jobq_core::RetryPolicy;

use crate::task_queue::DEFAULT_QUEUE_NAME;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Postgres connections needed beyond one per worker. A worker keeps one
/// connection for its job lease and needs a second one for row reads and
/// writes; the API needs one for queries.
pub const DB_CONNECTION_HEADROOM: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key} is required when {reason}")]
    Missing { key: &'static str, reason: &'static str },

    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    /// Postgres + Redis instead of the in-memory store and queue.
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub queue_name: String,
    pub workers: usize,
    /// Run the worker pool inside the API process.
    pub embedded_workers: bool,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub blocking_threads: usize,
    pub visibility_timeout: Duration,
    pub db_max_connections: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            use_persistent_stores: false,
            database_url: None,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            workers: 4,
            embedded_workers: true,
            max_retries: 3,
            retry_backoff: Duration::from_secs(10),
            blocking_threads: 64,
            visibility_timeout: Duration::from_secs(300),
            db_max_connections: 16,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let use_persistent_stores = parse_bool(
            "USE_PERSISTENT_STORES",
            get("USE_PERSISTENT_STORES"),
            defaults.use_persistent_stores,
        )?;

        let database_url = get("DATABASE_URL");
        if use_persistent_stores && database_url.is_none() {
            return Err(ConfigError::Missing {
                key: "DATABASE_URL",
                reason: "USE_PERSISTENT_STORES is enabled",
            });
        }

        let redis_url = match get("REDIS_URL") {
            Some(url) => url,
            None => {
                if use_persistent_stores {
                    warn!(default = DEFAULT_REDIS_URL, "REDIS_URL not set; using default");
                }
                defaults.redis_url
            }
        };

        let settings = Self {
            bind_addr: parse("JOBQ_BIND_ADDR", get("JOBQ_BIND_ADDR"), defaults.bind_addr)?,
            use_persistent_stores,
            database_url,
            redis_url,
            queue_name: get("JOBQ_QUEUE_NAME").unwrap_or(defaults.queue_name),
            workers: parse("JOBQ_WORKERS", get("JOBQ_WORKERS"), defaults.workers)?,
            embedded_workers: parse_bool(
                "JOBQ_EMBEDDED_WORKERS",
                get("JOBQ_EMBEDDED_WORKERS"),
                defaults.embedded_workers,
            )?,
            max_retries: parse("JOBQ_MAX_RETRIES", get("JOBQ_MAX_RETRIES"), defaults.max_retries)?,
            retry_backoff: Duration::from_secs(parse(
                "JOBQ_RETRY_BACKOFF_SECS",
                get("JOBQ_RETRY_BACKOFF_SECS"),
                defaults.retry_backoff.as_secs(),
            )?),
            blocking_threads: parse(
                "JOBQ_BLOCKING_THREADS",
                get("JOBQ_BLOCKING_THREADS"),
                defaults.blocking_threads,
            )?,
            visibility_timeout: Duration::from_secs(parse(
                "JOBQ_VISIBILITY_TIMEOUT_SECS",
                get("JOBQ_VISIBILITY_TIMEOUT_SECS"),
                defaults.visibility_timeout.as_secs(),
            )?),
            db_max_connections: parse(
                "JOBQ_DB_MAX_CONNECTIONS",
                get("JOBQ_DB_MAX_CONNECTIONS"),
                defaults.db_max_connections,
            )?,
        };

        if settings.workers == 0 {
            return Err(invalid("JOBQ_WORKERS", "0", "must be at least 1"));
        }
        if settings.blocking_threads == 0 {
            return Err(invalid("JOBQ_BLOCKING_THREADS", "0", "must be at least 1"));
        }
        if settings.use_persistent_stores {
            let needed = u32::try_from(settings.workers)
                .unwrap_or(u32::MAX)
                .saturating_add(DB_CONNECTION_HEADROOM);
            if settings.db_max_connections < needed {
                return Err(invalid(
                    "JOBQ_DB_MAX_CONNECTIONS",
                    &settings.db_max_connections.to_string(),
                    format!(
                        "must be at least {needed} for {} workers (one lease connection each plus {DB_CONNECTION_HEADROOM})",
                        settings.workers
                    ),
                ));
            }
        }

        Ok(settings)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_retries, self.retry_backoff)
    }
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| invalid(key, &raw, e.to_string())),
    }
}

fn parse_bool(key: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, &raw, "expected true/false")),
    }
}
