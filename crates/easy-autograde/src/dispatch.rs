// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Load-accounted dispatch of grading requests.
//!
//! Every grading call is wrapped in a [`LoadGuard`]: the executor's load is
//! incremented before the call and decremented after it on every exit path,
//! including the task being aborted by the timeout sweep. The load round-trips
//! run on their own tasks, tracked by the [`Dispatcher`], so that dropping the
//! caller's future never loses one half of the pair and shutdown can wait for
//! every outstanding decrement with [`Dispatcher::wait_for_releases`].

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::client::GradingClient;
use crate::error::{Error, Result};
use crate::executor::{
    AutoAssessment, CapableExecutor, ExecutorId, ExecutorRequest, SpecId, select_executor,
};
use crate::registry::ExecutorRegistry;

/// Holds one unit of an executor's load.
///
/// Call [`release`](Self::release) on the normal path. If the guard is dropped
/// while still held (the owning task was aborted or panicked), the decrement is
/// spawned onto the current runtime. Both load round-trips run on `releases`.
pub struct LoadGuard {
    registry: Arc<dyn ExecutorRegistry>,
    releases: TaskTracker,
    executor_id: ExecutorId,
    held: bool,
}

impl LoadGuard {
    /// Increment the executor's load and return a guard for it.
    pub async fn acquire(
        registry: Arc<dyn ExecutorRegistry>,
        releases: TaskTracker,
        executor_id: ExecutorId,
    ) -> Result<Self> {
        let (tx, rx) = oneshot::channel();
        let task_registry = registry.clone();

        releases.spawn(async move {
            let result = task_registry.increment_load(executor_id).await;
            // Nobody will own a guard for this increment, undo it here.
            if let Err(Ok(())) = tx.send(result) {
                debug!(executor_id, "Load acquire abandoned, undoing increment");
                if let Err(e) = task_registry.decrement_load(executor_id).await {
                    error!(executor_id, error = %e, "Failed to undo abandoned load increment");
                }
            }
        });

        match rx.await {
            Ok(Ok(())) => Ok(Self {
                registry,
                releases,
                executor_id,
                held: true,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::JobPanicked(format!(
                "load increment task for executor {} panicked",
                executor_id
            ))),
        }
    }

    /// Executor this guard holds load on.
    pub fn executor_id(&self) -> ExecutorId {
        self.executor_id
    }

    /// Decrement the executor's load.
    pub async fn release(mut self) {
        self.held = false;
        let handle = self.spawn_decrement();
        if let Err(e) = handle.await {
            error!(executor_id = self.executor_id, error = %e, "Load release task failed");
        }
    }

    fn spawn_decrement(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let executor_id = self.executor_id;
        self.releases.spawn(async move {
            if let Err(e) = registry.decrement_load(executor_id).await {
                error!(executor_id, error = %e, "Failed to decrement executor load");
            }
        })
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(_) => {
                debug!(
                    executor_id = self.executor_id,
                    "Load guard dropped while held, releasing in background"
                );
                self.spawn_decrement();
            }
            Err(_) => error!(
                executor_id = self.executor_id,
                "Load guard dropped outside a runtime, load not released"
            ),
        }
    }
}


/// Selects executors and performs load-accounted grading calls.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<dyn ExecutorRegistry>,
    client: Arc<dyn GradingClient>,
    releases: TaskTracker,
}

impl Dispatcher {
    /// Create a new dispatcher.
    pub fn new(registry: Arc<dyn ExecutorRegistry>, client: Arc<dyn GradingClient>) -> Self {
        Self {
            registry,
            client,
            releases: TaskTracker::new(),
        }
    }

    /// The registry this dispatcher accounts load against.
    pub fn registry(&self) -> &Arc<dyn ExecutorRegistry> {
        &self.registry
    }

    /// Select the least loaded capable executor for `spec_id` and grade on it.
    pub async fn dispatch(
        &self,
        spec_id: SpecId,
        request: ExecutorRequest,
    ) -> Result<AutoAssessment> {
        let executors = self.registry.list_capable_executors(spec_id).await?;
        let selected = select_executor(&executors)?.clone();
        self.call_selected(selected, request).await
    }

    /// Grade on an already selected executor, holding one unit of its load.
    ///
    /// Failures are returned as-is, never retried.
    pub async fn call_selected(
        &self,
        executor: CapableExecutor,
        request: ExecutorRequest,
    ) -> Result<AutoAssessment> {
        let guard =
            LoadGuard::acquire(self.registry.clone(), self.releases.clone(), executor.id).await?;

        let result = self.client.grade(&executor, &request).await;

        guard.release().await;

        match &result {
            Ok(assessment) => info!(
                executor_id = executor.id,
                grade = assessment.grade,
                "Call finished to executor"
            ),
            Err(e) => error!(executor_id = executor.id, error = %e, "Call to executor failed"),
        }

        result
    }

    /// Wait until every load increment and decrement started so far has finished.
    ///
    /// Call after the grading tasks have stopped; guards dropped later are
    /// still released but no longer waited for.
    pub async fn wait_for_releases(&self) {
        self.releases.close();
        self.releases.wait().await;
        debug!("All executor load releases finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockGradingClient;
    use crate::executor::AutoExercise;
    use crate::registry::MemoryExecutorRegistry;
    use std::time::Duration;

    fn exercise() -> AutoExercise {
        AutoExercise {
            id: 1,
            grading_script: "grade.sh".to_string(),
            container_image: "python".to_string(),
            max_time: 5,
            max_mem: 64,
            assets: vec![],
        }
    }

    async fn registry_with(executors: &[(ExecutorId, i32)]) -> Arc<MemoryExecutorRegistry> {
        let registry = Arc::new(MemoryExecutorRegistry::new());
        for (id, max_load) in executors {
            registry
                .add_executor(*id, "http://mock", *max_load, &["python"])
                .await;
        }
        registry.add_exercise(exercise()).await;
        registry
    }

    async fn wait_for_load(registry: &MemoryExecutorRegistry, id: ExecutorId, expected: i32) {
        for _ in 0..100 {
            if registry.load(id).await == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "load of executor {} never reached {}, is {:?}",
            id,
            expected,
            registry.load(id).await
        );
    }

    #[tokio::test]
    async fn test_dispatch_uses_least_loaded_executor() {
        let registry = registry_with(&[(1, 10), (2, 4)]).await;
        registry.set_load(1, 2).await;
        registry.set_load(2, 1).await;
        let client = Arc::new(MockGradingClient::new());
        let dispatcher = Dispatcher::new(registry.clone(), client.clone());

        let assessment = dispatcher
            .dispatch(1, exercise().to_request("x"))
            .await
            .unwrap();

        assert_eq!(assessment.grade, 100);
        assert_eq!(client.calls().await, vec![1]);
        assert_eq!(registry.load(1).await, Some(2));
    }

    #[tokio::test]
    async fn test_dispatch_no_executors() {
        let registry = registry_with(&[]).await;
        let dispatcher = Dispatcher::new(registry, Arc::new(MockGradingClient::new()));

        let result = dispatcher.dispatch(1, exercise().to_request("x")).await;
        assert!(matches!(result, Err(Error::NoExecutorsAvailable)));
    }

    #[tokio::test]
    async fn test_dispatch_overloaded_does_not_call_or_touch_load() {
        let registry = registry_with(&[(1, 2)]).await;
        registry.set_load(1, 2).await;
        let client = Arc::new(MockGradingClient::new());
        let dispatcher = Dispatcher::new(registry.clone(), client.clone());

        let result = dispatcher.dispatch(1, exercise().to_request("x")).await;

        assert!(matches!(
            result,
            Err(Error::AllExecutorsOverloaded { executor_id: 1, .. })
        ));
        assert!(client.calls().await.is_empty());
        assert_eq!(registry.load(1).await, Some(2));
    }

    #[tokio::test]
    async fn test_load_released_after_failure() {
        let registry = registry_with(&[(1, 2)]).await;
        let dispatcher = Dispatcher::new(registry.clone(), Arc::new(MockGradingClient::failing()));

        let result = dispatcher.dispatch(1, exercise().to_request("x")).await;

        assert!(matches!(result, Err(Error::ExecutorCallFailed { .. })));
        assert_eq!(registry.load(1).await, Some(0));
    }

    #[tokio::test]
    async fn test_load_held_during_call() {
        let registry = registry_with(&[(1, 2)]).await;
        let client = Arc::new(MockGradingClient::with_delay(200));
        let dispatcher = Dispatcher::new(registry.clone(), client);

        let task = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch(1, exercise().to_request("x")).await }
        });

        wait_for_load(&registry, 1, 1).await;
        task.await.unwrap().unwrap();
        assert_eq!(registry.load(1).await, Some(0));
    }

    #[tokio::test]
    async fn test_concurrent_dispatches_return_load_to_baseline() {
        let registry = registry_with(&[(1, 100)]).await;
        registry.set_load(1, 3).await;
        let client = Arc::new(MockGradingClient::with_delay(20));
        let dispatcher = Dispatcher::new(registry.clone(), client.clone());

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher
                        .dispatch(1, exercise().to_request(format!("submission {}", i)))
                        .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(registry.load(1).await, Some(3));
        assert!(client.peak_in_flight() > 1);
    }

    #[tokio::test]
    async fn test_aborted_call_releases_load() {
        let registry = registry_with(&[(1, 2)]).await;
        let dispatcher = Dispatcher::new(
            registry.clone(),
            Arc::new(MockGradingClient::never_completing()),
        );

        let task = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch(1, exercise().to_request("x")).await }
        });

        wait_for_load(&registry, 1, 1).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        wait_for_load(&registry, 1, 0).await;
    }

    #[tokio::test]
    async fn test_mixed_outcomes_return_load_to_baseline() {
        let registry = registry_with(&[(1, 100)]).await;
        registry.set_load(1, 5).await;
        let succeeding = Dispatcher::new(
            registry.clone(),
            Arc::new(MockGradingClient::with_delay(20)),
        );
        let failing = Dispatcher::new(registry.clone(), Arc::new(MockGradingClient::failing()));

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let dispatcher = if i % 2 == 0 {
                    succeeding.clone()
                } else {
                    failing.clone()
                };
                tokio::spawn(async move {
                    dispatcher
                        .dispatch(1, exercise().to_request(format!("submission {}", i)))
                        .await
                })
            })
            .collect();

        let mut failures = 0;
        for task in tasks {
            if task.await.unwrap().is_err() {
                failures += 1;
            }
        }

        assert_eq!(failures, 10);
        assert_eq!(registry.load(1).await, Some(5));
    }

    #[tokio::test]
    async fn test_guard_holds_one_unit_until_released() {
        let registry = registry_with(&[(4, 2)]).await;
        let releases = TaskTracker::new();

        let guard = LoadGuard::acquire(registry.clone(), releases.clone(), 4)
            .await
            .unwrap();
        assert_eq!(guard.executor_id(), 4);
        assert_eq!(registry.load(4).await, Some(1));

        guard.release().await;
        assert_eq!(registry.load(4).await, Some(0));
    }

    #[tokio::test]
    async fn test_acquire_unknown_executor_fails() {
        let registry = registry_with(&[]).await;

        let result = LoadGuard::acquire(registry, TaskTracker::new(), 99).await;
        assert!(matches!(result, Err(Error::ExecutorNotFound(99))));
    }

    #[tokio::test]
    async fn test_wait_for_releases_covers_dropped_guards() {
        let registry = registry_with(&[(1, 2)]).await;
        let dispatcher = Dispatcher::new(
            registry.clone(),
            Arc::new(MockGradingClient::never_completing()),
        );

        let task = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch(1, exercise().to_request("x")).await }
        });
        wait_for_load(&registry, 1, 1).await;

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        dispatcher.wait_for_releases().await;

        assert_eq!(registry.load(1).await, Some(0));
    }
}
