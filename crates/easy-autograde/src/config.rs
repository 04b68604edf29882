// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for easy-autograde.

use std::time::Duration;

/// Autograde configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string for the executor registry
    pub database_url: String,
    /// Maximum connections in the database pool
    pub db_max_connections: u32,
    /// How often the admission worker starts pending jobs
    pub admission_interval: Duration,
    /// How often the timeout sweep runs
    pub sweep_interval: Duration,
    /// Jobs older than this are cancelled by the sweep
    pub max_running: Duration,
    /// How long a caller waits on a grading ticket
    pub user_wait: Duration,
    /// Connect/read timeout for executor HTTP calls
    pub executor_request_timeout: Duration,
    /// Optional bound on pending jobs per queue
    pub max_pending: Option<usize>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("AUTOGRADE_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| ConfigError::MissingEnvVar("AUTOGRADE_DATABASE_URL or DATABASE_URL"))?;

        let db_max_connections = parse_var("AUTOGRADE_DB_MAX_CONNECTIONS", 10)?;
        let admission_interval_ms = parse_var("AUTOGRADE_ADMISSION_INTERVAL_MS", 1000)?;
        let sweep_interval_secs = parse_var("AUTOGRADE_SWEEP_INTERVAL_SECS", 60)?;
        let max_running_ms = parse_var("AUTOGRADE_MAX_RUNNING_MS", 3_600_000)?;
        let user_wait_ms = parse_var("AUTOGRADE_USER_WAIT_MS", 300_000)?;
        let executor_timeout_secs = parse_var("AUTOGRADE_EXECUTOR_REQUEST_TIMEOUT_SECS", 3600)?;

        let max_pending = match std::env::var("AUTOGRADE_MAX_PENDING") {
            Ok(v) => Some(
                v.parse()
                    .map_err(|_| ConfigError::InvalidValue("AUTOGRADE_MAX_PENDING"))?,
            ),
            Err(_) => None,
        };

        Ok(Self {
            database_url,
            db_max_connections,
            admission_interval: Duration::from_millis(admission_interval_ms),
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            max_running: Duration::from_millis(max_running_ms),
            user_wait: Duration::from_millis(user_wait_ms),
            executor_request_timeout: Duration::from_secs(executor_timeout_secs),
            max_pending,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
