// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Easy Autograde - grading dispatch daemon
//!
//! Runs the auto-grade scheduler against the PostgreSQL executor registry:
//! - Admission of queued grading jobs
//! - Sweep of jobs past their running budget

use std::sync::Arc;
use tracing::{info, warn};

use easy_autograde::client::HttpGradingClient;
use easy_autograde::config::Config;
use easy_autograde::migrations;
use easy_autograde::runtime::GraderRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "easy_autograde=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        admission_interval_ms = config.admission_interval.as_millis() as u64,
        sweep_interval_secs = config.sweep_interval.as_secs(),
        user_wait_ms = config.user_wait.as_millis() as u64,
        max_pending = ?config.max_pending,
        "Starting Easy Autograde"
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    migrations::run(&pool).await?;

    info!("Database schema verified");

    let client = Arc::new(HttpGradingClient::new(config.executor_request_timeout)?);

    let runtime = GraderRuntime::builder()
        .config(&config)
        .pool(pool)
        .client(client)
        .build()?
        .start()
        .await?;

    info!("Easy Autograde ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Easy Autograde shut down");

    Ok(())
}
