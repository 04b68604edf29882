// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admission driver.
//!
//! Calls [`AutoGradeScheduler::admit`] at a fixed cadence. Each tick starts
//! queued grading jobs up to every executor's free capacity. A tick runs to
//! completion before the next delay starts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::scheduler::AutoGradeScheduler;

/// Configuration for the admission worker.
#[derive(Debug, Clone)]
pub struct AdmissionWorkerConfig {
    /// Delay between admission ticks.
    pub interval: Duration,
}

impl Default for AdmissionWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
        }
    }
}

/// Background worker that admits queued grading jobs.
pub struct AdmissionWorker {
    scheduler: Arc<AutoGradeScheduler>,
    config: AdmissionWorkerConfig,
    shutdown: Arc<Notify>,
}

impl AdmissionWorker {
    /// Create a new admission worker.
    pub fn new(scheduler: Arc<AutoGradeScheduler>, config: AdmissionWorkerConfig) -> Self {
        Self {
            scheduler,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the admission loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Admission worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Admission worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    let started = self.scheduler.admit().await;
                    if started > 0 {
                        debug!(started, "Admission tick");
                    }
                }
            }
        }
    }
}
