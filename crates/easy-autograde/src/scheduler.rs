// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Auto-grade scheduler.
//!
//! Every executor known to the registry gets one [`JobQueue`] per
//! [`PriorityLevel`]. Submissions are queued on the least occupied capable
//! executor; the admission driver calls [`AutoGradeScheduler::admit`] to start
//! as many queued jobs as each executor has free capacity for, alternating
//! between priority queues.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::executor::{
    AutoAssessment, CapableExecutor, ExecutorId, ExecutorRequest, PriorityLevel, SpecId,
    least_loaded,
};
use crate::queue::JobQueue;
use crate::registry::ExecutorRegistry;

/// Queue of grading calls bound to one executor and priority.
pub type GradingQueue = JobQueue<(CapableExecutor, ExecutorRequest), Result<AutoAssessment>>;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long `submit_and_await` waits for a result
    pub user_wait: Duration,
    /// Pending depth of each queue, `None` for unbounded
    pub max_pending: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            user_wait: Duration::from_secs(300),
            max_pending: None,
        }
    }
}

struct ExecutorQueues(BTreeMap<PriorityLevel, Arc<GradingQueue>>);

impl ExecutorQueues {
    fn new(
        executor_id: ExecutorId,
        dispatcher: &Dispatcher,
        runtime: &Handle,
        config: &SchedulerConfig,
    ) -> Self {
        let queues = PriorityLevel::ALL
            .into_iter()
            .map(|priority| {
                let dispatcher = dispatcher.clone();
                let queue = JobQueue::new(
                    format!("executor-{}-{:?}", executor_id, priority),
                    runtime.clone(),
                    move |(executor, request): (CapableExecutor, ExecutorRequest)| {
                        let dispatcher = dispatcher.clone();
                        async move { dispatcher.call_selected(executor, request).await }
                    },
                )
                .with_max_pending(config.max_pending);
                (priority, Arc::new(queue))
            })
            .collect();
        Self(queues)
    }

    fn get(&self, priority: PriorityLevel) -> Option<&Arc<GradingQueue>> {
        self.0.get(&priority)
    }

    fn queues(&self) -> impl Iterator<Item = &Arc<GradingQueue>> {
        self.0.values()
    }

    fn waiting(&self) -> usize {
        self.queues().map(|q| q.pending_count()).sum()
    }

    fn running(&self) -> usize {
        self.queues().map(|q| q.count_active()).sum()
    }

    fn size(&self) -> usize {
        self.queues().map(|q| q.size()).sum()
    }
}

/// Priority-aware scheduler of grading requests over all executors.
pub struct AutoGradeScheduler {
    dispatcher: Dispatcher,
    runtime: Handle,
    config: SchedulerConfig,
    executors: Mutex<BTreeMap<ExecutorId, ExecutorQueues>>,
    queue_picker: AtomicUsize,
}

impl AutoGradeScheduler {
    /// Create a scheduler whose jobs run on `runtime`.
    pub fn new(dispatcher: Dispatcher, runtime: Handle, config: SchedulerConfig) -> Self {
        Self {
            dispatcher,
            runtime,
            config,
            executors: Mutex::new(BTreeMap::new()),
            queue_picker: AtomicUsize::new(0),
        }
    }

    fn registry(&self) -> &Arc<dyn ExecutorRegistry> {
        self.dispatcher.registry()
    }

    /// Add queues for registry executors that have none yet. Returns how many were added.
    pub async fn sync_executors(&self) -> Result<usize> {
        let ids = self.registry().list_executor_ids().await?;

        let mut executors = self.executors.lock().await;
        let count_before = executors.len();
        for id in ids {
            executors.entry(id).or_insert_with(|| {
                ExecutorQueues::new(id, &self.dispatcher, &self.runtime, &self.config)
            });
        }

        debug!(
            before = count_before,
            after = executors.len(),
            "Checked for new executors"
        );
        Ok(executors.len() - count_before)
    }

    /// Queue a submission for grading and wait for the assessment.
    ///
    /// Picks the capable executor whose `priority` queue is least occupied
    /// relative to its load cap.
    pub async fn submit_and_await(
        &self,
        spec_id: SpecId,
        submission: impl Into<String>,
        priority: PriorityLevel,
    ) -> Result<AutoAssessment> {
        let exercise = self
            .registry()
            .auto_exercise(spec_id)
            .await?
            .ok_or_else(|| Error::EntityNotFound(format!("auto exercise {}", spec_id)))?;
        let request = exercise.to_request(submission);

        if self.executors.lock().await.is_empty() {
            self.sync_executors().await?;
        }

        let (queue, ticket) = {
            let executors = self.executors.lock().await;
            let capable = self.registry().list_capable_executors(spec_id).await?;

            let candidates: Vec<(CapableExecutor, &Arc<GradingQueue>)> = capable
                .into_iter()
                .filter_map(|executor| {
                    let queue = executors.get(&executor.id)?.get(priority)?;
                    Some((executor, queue))
                })
                .collect();

            let occupancy: Vec<CapableExecutor> = candidates
                .iter()
                .map(|(executor, queue)| CapableExecutor {
                    load: i32::try_from(queue.size()).unwrap_or(i32::MAX),
                    ..executor.clone()
                })
                .collect();

            let chosen = least_loaded(&occupancy).ok_or(Error::NoExecutorsAvailable)?;
            let (executor, queue) = candidates
                .iter()
                .find(|(executor, _)| executor.id == chosen.id)
                .ok_or(Error::NoExecutorsAvailable)?;

            let ticket = queue.submit((executor.clone(), request))?;
            debug!(
                spec_id,
                executor_id = executor.id,
                ?priority,
                %ticket,
                "Submission queued"
            );
            (Arc::clone(queue), ticket)
        };

        queue.await_result(ticket, self.config.user_wait).await?
    }

    /// One admission tick. Returns how many jobs were started.
    ///
    /// For every executor, starts `min(waiting, max_load - running)` jobs,
    /// picking among its non-empty priority queues round-robin.
    pub async fn admit(&self) -> usize {
        let executors = self.executors.lock().await;
        let mut started = 0;

        for (executor_id, queues) in executors.iter() {
            let waiting = queues.waiting();
            if waiting == 0 {
                continue;
            }

            let max_load = match self.registry().max_load(*executor_id).await {
                Ok(Some(max_load)) => max_load,
                Ok(None) => {
                    warn!(executor_id, "Executor has queued jobs but is not registered");
                    continue;
                }
                Err(e) => {
                    warn!(executor_id, error = %e, "Failed to read executor max load");
                    continue;
                }
            };

            let capacity = usize::try_from(max_load).unwrap_or(0);
            let executable = waiting.min(capacity.saturating_sub(queues.running()));

            for _ in 0..executable {
                let startable: Vec<_> = queues.queues().filter(|q| q.pending_count() > 0).collect();
                if startable.is_empty() {
                    break;
                }
                let pick = self
                    .queue_picker
                    .fetch_add(1, Ordering::Relaxed)
                    .wrapping_add(1);
                started += startable[pick % startable.len()].start_up_to_n(1);
            }
        }

        if started > 0 {
            debug!(started, "Admitted grading jobs");
        }
        started
    }

    /// Cancel and remove jobs older than `max_age` in every queue.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let executors = self.executors.lock().await;
        executors
            .values()
            .flat_map(|queues| queues.queues())
            .map(|queue| queue.sweep_expired(max_age))
            .sum()
    }

    /// Cancel every queued and running job and wait until their load is released.
    ///
    /// Used at shutdown. Returns how many jobs were cancelled.
    pub async fn cancel_all(&self) -> usize {
        let executors = self.executors.lock().await;
        let mut cancelled = 0;
        for queue in executors.values().flat_map(|queues| queues.queues()) {
            cancelled += queue.shutdown().await;
        }
        drop(executors);

        self.dispatcher.wait_for_releases().await;
        cancelled
    }

    /// Delete an executor and drop its queues.
    ///
    /// Refuses while the executor has queued or running jobs unless `force`
    /// is set, in which case those jobs are cancelled.
    pub async fn delete_executor(&self, executor_id: ExecutorId, force: bool) -> Result<()> {
        let mut executors = self.executors.lock().await;

        let load = executors.get(&executor_id).map_or(0, |q| q.size());
        if !force && load > 0 {
            return Err(Error::InvalidRequest(format!(
                "Executor load != 0 (is {}). Set 'force'=true for forced removal.",
                load
            )));
        }

        let deleted = self.registry().delete_executor(executor_id).await?;
        let queues = executors.remove(&executor_id);

        if !deleted && queues.is_none() {
            return Err(Error::ExecutorNotFound(executor_id));
        }

        let cancelled: usize = queues
            .iter()
            .flat_map(|q| q.queues())
            .map(|queue| queue.cancel_all())
            .sum();

        info!(executor_id, cancelled, "Executor deleted");
        Ok(())
    }

    /// IDs of executors that have queues.
    pub async fn executor_ids(&self) -> Vec<ExecutorId> {
        self.executors.lock().await.keys().copied().collect()
    }

    /// The queue of an executor for one priority.
    pub async fn queue(
        &self,
        executor_id: ExecutorId,
        priority: PriorityLevel,
    ) -> Option<Arc<GradingQueue>> {
        let executors = self.executors.lock().await;
        executors.get(&executor_id)?.get(priority).cloned()
    }

    /// Queued plus running jobs of an executor across priorities.
    pub async fn queued_jobs(&self, executor_id: ExecutorId) -> Option<usize> {
        let executors = self.executors.lock().await;
        executors.get(&executor_id).map(|q| q.size())
    }
}
