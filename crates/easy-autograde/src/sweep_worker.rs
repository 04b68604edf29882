// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that reclaims grading jobs running past their budget.
//!
//! Every `interval` it sweeps all scheduler queues, aborting jobs submitted
//! more than `max_age` ago. Aborted jobs release their executor load slot.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::scheduler::AutoGradeScheduler;

/// Configuration for the sweep worker.
#[derive(Debug, Clone)]
pub struct SweepWorkerConfig {
    /// How often to sweep.
    pub interval: Duration,
    /// Jobs older than this are cancelled.
    pub max_age: Duration,
}

impl Default for SweepWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_age: Duration::from_secs(3600),
        }
    }
}

/// Periodically calls [`AutoGradeScheduler::sweep`].
pub struct SweepWorker {
    scheduler: Arc<AutoGradeScheduler>,
    config: SweepWorkerConfig,
    shutdown: Arc<Notify>,
}

impl SweepWorker {
    /// Create a new sweep worker.
    pub fn new(scheduler: Arc<AutoGradeScheduler>, config: SweepWorkerConfig) -> Self {
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

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            max_age_secs = self.config.max_age.as_secs(),
            "Sweep worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Sweep worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    let removed = self.scheduler.sweep(self.config.max_age).await;
                    debug!(removed, "Swept expired grading jobs");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockGradingClient;
    use crate::dispatch::Dispatcher;
    use crate::error::{Error, TimeoutReason};
    use crate::executor::{AutoExercise, PriorityLevel};
    use crate::registry::MemoryExecutorRegistry;
    use crate::scheduler::SchedulerConfig;
    use tokio::runtime::Handle;

    #[test]
    fn test_config_default() {
        let config = SweepWorkerConfig::default();
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.max_age, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_worker_cancels_stale_pending_jobs() {
        let registry = Arc::new(MemoryExecutorRegistry::new());
        registry.add_executor(1, "http://mock", 1, &["python"]).await;
        registry
            .add_exercise(AutoExercise {
                id: 1,
                grading_script: "grade.sh".to_string(),
                container_image: "python".to_string(),
                max_time: 5,
                max_mem: 64,
                assets: vec![],
            })
            .await;

        let scheduler = Arc::new(AutoGradeScheduler::new(
            Dispatcher::new(registry, Arc::new(MockGradingClient::new())),
            Handle::current(),
            SchedulerConfig {
                user_wait: Duration::from_secs(30),
                max_pending: None,
            },
        ));

        // No admission worker: the job stays pending until swept.
        let worker = SweepWorker::new(
            scheduler.clone(),
            SweepWorkerConfig {
                interval: Duration::from_millis(20),
                max_age: Duration::from_millis(50),
            },
        );
        let shutdown = worker.shutdown_handle();
        let handle = tokio::spawn(async move { worker.run().await });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.submit_and_await(1, "x", PriorityLevel::Authenticated),
        )
        .await
        .expect("sweep should resolve the wait");

        assert!(matches!(
            result,
            Err(Error::AwaitTimeout(TimeoutReason::Cancelled))
        ));
        assert_eq!(scheduler.queued_jobs(1).await, Some(0));

        shutdown.notify_one();
        handle.await.unwrap();
    }
}
