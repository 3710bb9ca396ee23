//! Runtime configuration loaded from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// Prometheus scrape endpoint; metrics are not exported when unset.
    pub metrics_addr: Option<SocketAddr>,
    pub sweep_interval: Duration,
    pub sweep_batch_size: usize,
    pub guard_interval: Duration,
    pub snapshot_interval: Duration,
    pub reservation_ttl: chrono::Duration,
    pub ageing_window_days: i64,
    /// Re-read the touched keys after each committed write.
    pub verify_commits: bool,
    pub runner_max_retries: u32,
    pub runner_base_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 10,
            metrics_addr: None,
            sweep_interval: Duration::from_secs(60),
            sweep_batch_size: 200,
            guard_interval: Duration::from_secs(300),
            snapshot_interval: Duration::from_secs(3600),
            reservation_ttl: chrono::Duration::minutes(30),
            ageing_window_days: 30,
            verify_commits: true,
            runner_max_retries: 5,
            runner_base_backoff: Duration::from_millis(250),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            db_max_connections: parse(&lookup, "STOCKLEDGER_DB_MAX_CONNECTIONS", d.db_max_connections)?,
            metrics_addr: parse_optional(&lookup, "STOCKLEDGER_METRICS_ADDR")?,
            sweep_interval: Duration::from_secs(parse(
                &lookup,
                "STOCKLEDGER_SWEEP_INTERVAL_SECS",
                d.sweep_interval.as_secs(),
            )?),
            sweep_batch_size: parse(&lookup, "STOCKLEDGER_SWEEP_BATCH_SIZE", d.sweep_batch_size)?,
            guard_interval: Duration::from_secs(parse(
                &lookup,
                "STOCKLEDGER_GUARD_INTERVAL_SECS",
                d.guard_interval.as_secs(),
            )?),
            snapshot_interval: Duration::from_secs(parse(
                &lookup,
                "STOCKLEDGER_SNAPSHOT_INTERVAL_SECS",
                d.snapshot_interval.as_secs(),
            )?),
            reservation_ttl: chrono::Duration::minutes(parse(
                &lookup,
                "STOCKLEDGER_RESERVATION_TTL_MINS",
                d.reservation_ttl.num_minutes(),
            )?),
            ageing_window_days: parse(&lookup, "STOCKLEDGER_AGEING_WINDOW_DAYS", d.ageing_window_days)?,
            verify_commits: parse(&lookup, "STOCKLEDGER_VERIFY_COMMITS", d.verify_commits)?,
            runner_max_retries: parse(&lookup, "STOCKLEDGER_RUNNER_MAX_RETRIES", d.runner_max_retries)?,
            runner_base_backoff: Duration::from_millis(parse(
                &lookup,
                "STOCKLEDGER_RUNNER_BASE_BACKOFF_MS",
                d.runner_base_backoff.as_millis() as u64,
            )?),
        }
        .validated()?)
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.sweep_batch_size == 0 {
            return Err(ConfigError::Invalid {
                var: "STOCKLEDGER_SWEEP_BATCH_SIZE",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.db_max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "STOCKLEDGER_DB_MAX_CONNECTIONS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(self)
    }
}

fn parse<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn parse_optional<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var).filter(|v| !v.trim().is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}
