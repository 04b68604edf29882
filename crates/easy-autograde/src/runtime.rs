// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for easy-autograde.
//!
//! [`GraderRuntime`] owns the scheduler and its background workers so the
//! grading subsystem can be embedded in an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use easy_autograde::executor::PriorityLevel;
//! use easy_autograde::row_lock::RowLock;
//! use easy_autograde::runtime::GraderRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     let sync_lock = Arc::new(RowLock::new(pool.clone(), "course", "id", "moodle_sync_in_progress")?);
//!
//!     let runtime = GraderRuntime::builder()
//!         .pool(pool)
//!         .row_lock(sync_lock.clone())
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let assessment = runtime
//!         .scheduler()
//!         .submit_and_await(exercise_id, submission, PriorityLevel::Authenticated)
//!         .await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::admission_worker::{AdmissionWorker, AdmissionWorkerConfig};
use crate::client::{GradingClient, HttpGradingClient};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::registry::{ExecutorRegistry, PgExecutorRegistry};
use crate::row_lock::RowLock;
use crate::scheduler::{AutoGradeScheduler, SchedulerConfig};
use crate::sweep_worker::{SweepWorker, SweepWorkerConfig};

/// Builder for creating a [`GraderRuntime`].
pub struct GraderRuntimeBuilder {
    pool: Option<PgPool>,
    registry: Option<Arc<dyn ExecutorRegistry>>,
    client: Option<Arc<dyn GradingClient>>,
    admission_interval: Duration,
    sweep_interval: Duration,
    max_running: Duration,
    user_wait: Duration,
    executor_request_timeout: Duration,
    max_pending: Option<usize>,
    row_locks: Vec<Arc<RowLock>>,
}

impl Default for GraderRuntimeBuilder {
    fn default() -> Self {
        Self {
            pool: None,
            registry: None,
            client: None,
            admission_interval: Duration::from_millis(1000),
            sweep_interval: Duration::from_secs(60),
            max_running: Duration::from_secs(3600),
            user_wait: Duration::from_secs(300),
            executor_request_timeout: Duration::from_secs(3600),
            max_pending: None,
            row_locks: Vec::new(),
        }
    }
}

impl GraderRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply intervals and limits from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.admission_interval = config.admission_interval;
        self.sweep_interval = config.sweep_interval;
        self.max_running = config.max_running;
        self.user_wait = config.user_wait;
        self.executor_request_timeout = config.executor_request_timeout;
        self.max_pending = config.max_pending;
        self
    }

    /// Set the PostgreSQL connection pool.
    ///
    /// Used for the executor registry unless [`registry`](Self::registry) is set.
    pub fn pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the executor registry.
    pub fn registry(mut self, registry: Arc<dyn ExecutorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the grading client.
    ///
    /// Default: [`HttpGradingClient`] with the executor request timeout.
    pub fn client(mut self, client: Arc<dyn GradingClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the delay between admission ticks.
    ///
    /// Default: 1 second
    pub fn admission_interval(mut self, interval: Duration) -> Self {
        self.admission_interval = interval;
        self
    }

    /// Set how often expired jobs are swept.
    ///
    /// Default: 60 seconds
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the age after which the sweep cancels a job.
    ///
    /// Default: 1 hour
    pub fn max_running(mut self, max_running: Duration) -> Self {
        self.max_running = max_running;
        self
    }

    /// Set how long `submit_and_await` waits for a result.
    ///
    /// Default: 5 minutes
    pub fn user_wait(mut self, user_wait: Duration) -> Self {
        self.user_wait = user_wait;
        self
    }

    /// Set the connect/read timeout of the default HTTP grading client.
    ///
    /// Default: 1 hour
    pub fn executor_request_timeout(mut self, timeout: Duration) -> Self {
        self.executor_request_timeout = timeout;
        self
    }

    /// Bound the pending depth of every queue.
    ///
    /// Default: unbounded
    pub fn max_pending(mut self, max_pending: Option<usize>) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Register a row lock to be force-released at startup and shutdown.
    pub fn row_lock(mut self, lock: Arc<RowLock>) -> Self {
        self.row_locks.push(lock);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if neither a registry nor a pool was given.
    pub fn build(self) -> Result<GraderRuntimeConfig> {
        let registry: Arc<dyn ExecutorRegistry> = match (self.registry, self.pool) {
            (Some(registry), _) => registry,
            (None, Some(pool)) => Arc::new(PgExecutorRegistry::new(pool)),
            (None, None) => return Err(anyhow::anyhow!("pool or registry is required")),
        };

        let client: Arc<dyn GradingClient> = match self.client {
            Some(client) => client,
            None => Arc::new(HttpGradingClient::new(self.executor_request_timeout)?),
        };

        Ok(GraderRuntimeConfig {
            registry,
            client,
            admission: AdmissionWorkerConfig {
                interval: self.admission_interval,
            },
            sweep: SweepWorkerConfig {
                interval: self.sweep_interval,
                max_age: self.max_running,
            },
            scheduler: SchedulerConfig {
                user_wait: self.user_wait,
                max_pending: self.max_pending,
            },
            row_locks: self.row_locks,
        })
    }
}

/// Configuration for a [`GraderRuntime`].
pub struct GraderRuntimeConfig {
    registry: Arc<dyn ExecutorRegistry>,
    client: Arc<dyn GradingClient>,
    admission: AdmissionWorkerConfig,
    sweep: SweepWorkerConfig,
    scheduler: SchedulerConfig,
    row_locks: Vec<Arc<RowLock>>,
}

impl GraderRuntimeConfig {
    /// Start the runtime: recover row locks, load executors and spawn the workers.
    pub async fn start(self) -> Result<GraderRuntime> {
        release_row_locks(&self.row_locks).await;

        let scheduler = Arc::new(AutoGradeScheduler::new(
            Dispatcher::new(self.registry, self.client),
            Handle::current(),
            self.scheduler,
        ));

        let executors = scheduler.sync_executors().await?;

        let admission_worker = AdmissionWorker::new(scheduler.clone(), self.admission);
        let admission_shutdown = admission_worker.shutdown_handle();
        let admission_handle = tokio::spawn(async move {
            admission_worker.run().await;
        });

        let sweep_worker = SweepWorker::new(scheduler.clone(), self.sweep);
        let sweep_shutdown = sweep_worker.shutdown_handle();
        let sweep_handle = tokio::spawn(async move {
            sweep_worker.run().await;
        });

        info!(executors, "GraderRuntime started");

        Ok(GraderRuntime {
            scheduler,
            admission_handle,
            sweep_handle,
            admission_shutdown,
            sweep_shutdown,
            row_locks: self.row_locks,
        })
    }
}

async fn release_row_locks(locks: &[Arc<RowLock>]) {
    for lock in locks {
        if let Err(e) = lock.release_all().await {
            warn!(table = lock.table(), error = %e, "Failed to release row locks");
        }
    }
}

/// A running grading subsystem.
///
/// The runtime manages:
/// - The auto-grade scheduler and its per-executor queues
/// - Admission worker starting queued jobs
/// - Sweep worker cancelling jobs past their running budget
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct GraderRuntime {
    scheduler: Arc<AutoGradeScheduler>,
    admission_handle: JoinHandle<()>,
    sweep_handle: JoinHandle<()>,
    admission_shutdown: Arc<Notify>,
    sweep_shutdown: Arc<Notify>,
    row_locks: Vec<Arc<RowLock>>,
}

impl GraderRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> GraderRuntimeBuilder {
        GraderRuntimeBuilder::new()
    }

    /// The scheduler grading requests are submitted to.
    pub fn scheduler(&self) -> &Arc<AutoGradeScheduler> {
        &self.scheduler
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops both workers, cancels every queued and running grading job, waits
    /// for their executor load to be released and releases the registered row
    /// locks.
    pub async fn shutdown(self) -> Result<()> {
        info!("GraderRuntime shutting down...");

        self.admission_shutdown.notify_one();
        self.sweep_shutdown.notify_one();

        if let Err(e) = self.admission_handle.await {
            error!("Admission worker task panicked: {}", e);
        }

        if let Err(e) = self.sweep_handle.await {
            error!("Sweep worker task panicked: {}", e);
        }

        let cancelled = self.scheduler.cancel_all().await;
        info!(cancelled, "Grading queues drained");

        release_row_locks(&self.row_locks).await;

        info!("GraderRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.admission_handle.is_finished() && !self.sweep_handle.is_finished()
    }
}
