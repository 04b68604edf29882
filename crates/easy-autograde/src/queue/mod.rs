// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job ticket queue.
//!
//! A [`JobQueue`] accepts job arguments, hands back a [`Ticket`] immediately
//! and executes queued jobs only when an external driver admits them with
//! [`start_up_to_n`](JobQueue::start_up_to_n). Callers wait for a ticket with
//! [`await_result`](JobQueue::await_result).
//!
//! ```text
//!   submit ──► Pending ──start_up_to_n──► Running ──► Resolved
//!                 │                          │
//!                 └──── sweep / timeout ─────┴──► TimedOut | Cancelled
//! ```
//!
//! Running jobs are tokio tasks. Sweeping or timing out a running job aborts
//! its task, so whatever the job holds (an executor load slot) is dropped.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, timeout_at};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::{Error, Result, TimeoutReason};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
type JobFn<A, T> = Arc<dyn Fn(A) -> BoxFuture<T> + Send + Sync>;

/// Shared by every queue so a ticket names at most one job in the process.
static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

/// Handle for a submitted job.
///
/// Tickets are strictly increasing and never reused, across all queues of the
/// process. They can only be obtained from [`JobQueue::submit`] and are
/// redeemed once, on the queue that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(u64);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct PendingJob<A, T> {
    ticket: Ticket,
    submitted_at: Instant,
    args: A,
    started_tx: oneshot::Sender<JoinHandle<T>>,
}

struct RunningJob {
    submitted_at: Instant,
    abort: AbortHandle,
}

/// Asynchronous, ticket-addressed job queue with externally driven admission.
pub struct JobQueue<A, T> {
    name: String,
    job: JobFn<A, T>,
    runtime: Handle,
    max_pending: Option<usize>,
    tasks: TaskTracker,
    pending: Mutex<VecDeque<PendingJob<A, T>>>,
    waiters: DashMap<Ticket, oneshot::Receiver<JoinHandle<T>>>,
    running: DashMap<Ticket, RunningJob>,
    sweep_lock: Mutex<()>,
}

impl<A, T> JobQueue<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    /// Create a queue that runs `job` for every admitted submission on `runtime`.
    pub fn new<F, Fut>(name: impl Into<String>, runtime: Handle, job: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self {
            name: name.into(),
            job: Arc::new(move |args| -> BoxFuture<T> { Box::pin(job(args)) }),
            runtime,
            max_pending: None,
            tasks: TaskTracker::new(),
            pending: Mutex::new(VecDeque::new()),
            waiters: DashMap::new(),
            running: DashMap::new(),
            sweep_lock: Mutex::new(()),
        }
    }

    /// Reject submissions once `max_pending` jobs are waiting. `None` means unbounded.
    pub fn with_max_pending(mut self, max_pending: Option<usize>) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Queue name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_pending(&self) -> MutexGuard<'_, VecDeque<PendingJob<A, T>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a job and return its ticket. Never blocks.
    ///
    /// Fails with [`Error::QueueFull`] only when a pending bound is configured.
    pub fn submit(&self, args: A) -> Result<Ticket> {
        let mut pending = self.lock_pending();

        if let Some(max) = self.max_pending
            && pending.len() >= max
        {
            warn!(queue = %self.name, max_pending = max, "Job queue is full");
            return Err(Error::QueueFull(max));
        }

        // Allocated under the pending lock so ticket order is queue order.
        let ticket = Ticket(NEXT_TICKET.fetch_add(1, Ordering::SeqCst));
        let (started_tx, started_rx) = oneshot::channel();
        self.waiters.insert(ticket, started_rx);
        pending.push_back(PendingJob {
            ticket,
            submitted_at: Instant::now(),
            args,
            started_tx,
        });

        debug!(queue = %self.name, %ticket, pending = pending.len(), "Job submitted");
        Ok(ticket)
    }

    /// Start at most `n` pending jobs in submission order. Returns how many started.
    pub fn start_up_to_n(&self, n: usize) -> usize {
        let jobs: Vec<_> = {
            let mut pending = self.lock_pending();
            let take = n.min(pending.len());
            pending.drain(..take).collect()
        };

        let started = jobs.len();
        for job in jobs {
            let handle = self.tasks.spawn_on((self.job)(job.args), &self.runtime);
            self.running.insert(
                job.ticket,
                RunningJob {
                    submitted_at: job.submitted_at,
                    abort: handle.abort_handle(),
                },
            );

            if job.started_tx.send(handle).is_err() {
                // Waiter gave up between admission and hand-off.
                debug!(queue = %self.name, ticket = %job.ticket, "Job abandoned at start");
                if let Some((_, running)) = self.running.remove(&job.ticket) {
                    running.abort.abort();
                }
            } else {
                debug!(queue = %self.name, ticket = %job.ticket, "Job started");
            }
        }

        started
    }

    /// Wait up to `timeout` for the ticket's result.
    ///
    /// A ticket can be redeemed once; every exit path removes its state. Timing
    /// out aborts the job. Timeout, cancellation and redeeming an unknown
    /// ticket all fail with [`Error::AwaitTimeout`].
    pub async fn await_result(&self, ticket: Ticket, timeout: Duration) -> Result<T> {
        let Some((_, mut started_rx)) = self.waiters.remove(&ticket) else {
            return Err(Error::AwaitTimeout(TimeoutReason::Reclaimed));
        };

        let deadline = Instant::now() + timeout;

        let handle = if timeout.is_zero() {
            None
        } else {
            match timeout_at(deadline, &mut started_rx).await {
                Ok(Ok(handle)) => Some(handle),
                Ok(Err(_)) => {
                    self.forget(ticket);
                    debug!(queue = %self.name, %ticket, "Pending job was cancelled");
                    return Err(Error::AwaitTimeout(TimeoutReason::Cancelled));
                }
                Err(_) => None,
            }
        };

        let mut handle = match handle {
            Some(handle) => handle,
            None => {
                // Close first so a concurrent start cannot hand off a task after this.
                started_rx.close();
                let reason = match started_rx.try_recv() {
                    Ok(handle) => {
                        handle.abort();
                        TimeoutReason::RunningTime
                    }
                    Err(_) => TimeoutReason::QueueWait,
                };
                self.abort_running(ticket);
                self.forget(ticket);
                debug!(queue = %self.name, %ticket, %reason, "Await timed out");
                return Err(Error::AwaitTimeout(reason));
            }
        };

        let outcome = match timeout_at(deadline, &mut handle).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if e.is_cancelled() => Err(Error::AwaitTimeout(TimeoutReason::Cancelled)),
            Ok(Err(e)) => Err(Error::JobPanicked(e.to_string())),
            Err(_) => {
                handle.abort();
                Err(Error::AwaitTimeout(TimeoutReason::RunningTime))
            }
        };

        self.forget(ticket);

        if let Err(e) = &outcome {
            debug!(queue = %self.name, %ticket, error = %e, "Job did not resolve");
        }
        outcome
    }

    fn abort_running(&self, ticket: Ticket) {
        if let Some((_, running)) = self.running.remove(&ticket) {
            running.abort.abort();
        }
    }

    fn forget(&self, ticket: Ticket) {
        self.lock_pending().retain(|job| job.ticket != ticket);
        self.running.remove(&ticket);
        self.waiters.remove(&ticket);
    }

    /// Number of running jobs whose task has not completed yet.
    pub fn count_active(&self) -> usize {
        self.running
            .iter()
            .filter(|entry| !entry.value().abort.is_finished())
            .count()
    }

    /// Number of jobs waiting for admission.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Pending plus active jobs.
    pub fn size(&self) -> usize {
        self.pending_count() + self.count_active()
    }

    /// True when nothing is pending and nothing is running.
    pub fn is_idle(&self) -> bool {
        self.pending_count() == 0 && self.count_active() == 0
    }

    /// Cancel and remove every job older than `max_age`. Returns how many were removed.
    ///
    /// Running jobs are aborted; callers waiting on a swept ticket get
    /// [`Error::AwaitTimeout`]. Sweeps are serialized.
    pub fn sweep_expired(&self, max_age: Duration) -> usize {
        let _sweep = self.sweep_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let expired = |submitted_at: Instant| now.saturating_duration_since(submitted_at) > max_age;

        let mut removed = Vec::new();

        self.running.retain(|ticket, job| {
            if expired(job.submitted_at) {
                job.abort.abort();
                removed.push(*ticket);
                false
            } else {
                true
            }
        });

        self.lock_pending().retain(|job| {
            if expired(job.submitted_at) {
                removed.push(job.ticket);
                false
            } else {
                true
            }
        });

        for ticket in &removed {
            self.waiters.remove(ticket);
        }

        if !removed.is_empty() {
            debug!(queue = %self.name, removed = removed.len(), "Swept expired jobs");
        }
        removed.len()
    }

    /// Cancel everything in the queue. Returns how many jobs were removed.
    pub fn cancel_all(&self) -> usize {
        let _sweep = self.sweep_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut removed = 0;
        self.running.retain(|_, job| {
            job.abort.abort();
            removed += 1;
            false
        });

        let mut pending = self.lock_pending();
        removed += pending.len();
        pending.clear();
        drop(pending);

        self.waiters.clear();
        removed
    }

    /// Cancel everything and wait until every job task has been dropped.
    ///
    /// Jobs admitted after this call are not waited for.
    pub async fn shutdown(&self) -> usize {
        let removed = self.cancel_all();
        self.tasks.close();
        self.tasks.wait().await;
        debug!(queue = %self.name, removed, "Job queue shut down");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::time::sleep;

    fn doubling_queue() -> JobQueue<u64, u64> {
        JobQueue::new("test", Handle::current(), |ms: u64| async move {
            sleep(Duration::from_millis(ms)).await;
            ms * 2
        })
    }

    fn stuck_queue() -> JobQueue<(), ()> {
        JobQueue::new("stuck", Handle::current(), |_: ()| std::future::pending::<()>())
    }

    fn assert_timeout<T: fmt::Debug>(result: Result<T>, expected: TimeoutReason) {
        match result {
            Err(Error::AwaitTimeout(reason)) => assert_eq!(reason, expected),
            other => panic!("expected AwaitTimeout({:?}), got {:?}", expected, other),
        }
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_tickets_strictly_increase() {
        let queue = doubling_queue();
        let tickets: Vec<_> = (0..10).map(|i| queue.submit(i).unwrap()).collect();

        assert!(tickets.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(queue.pending_count(), 10);
        assert_eq!(queue.count_active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_ticket_is_single_use() {
        let queue = doubling_queue();
        let ticket = queue.submit(10).unwrap();
        assert_eq!(queue.start_up_to_n(5), 1);

        let value = queue
            .await_result(ticket, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(value, 20);

        assert_timeout(
            queue.await_result(ticket, Duration::from_secs(1)).await,
            TimeoutReason::Reclaimed,
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_is_fifo_and_bounded() {
        let queue = doubling_queue();
        let tickets: Vec<_> = (1..=5).map(|i| queue.submit(i).unwrap()).collect();

        assert_eq!(queue.start_up_to_n(2), 2);
        assert_eq!(queue.pending_count(), 3);

        assert_eq!(
            queue
                .await_result(tickets[0], Duration::from_secs(1))
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            queue
                .await_result(tickets[1], Duration::from_secs(1))
                .await
                .unwrap(),
            4
        );

        // Third job was never admitted.
        assert_timeout(
            queue.await_result(tickets[2], Duration::from_millis(100)).await,
            TimeoutReason::QueueWait,
        );
        assert_eq!(queue.pending_count(), 2);

        assert_eq!(queue.start_up_to_n(10), 2);
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(
            queue
                .await_result(tickets[4], Duration::from_secs(1))
                .await
                .unwrap(),
            10
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_from_another_task_wakes_waiter() {
        let queue = Arc::new(doubling_queue());
        let ticket = queue.submit(5).unwrap();

        let admitter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(200)).await;
                queue.start_up_to_n(1)
            })
        };

        let value = queue
            .await_result(ticket, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(value, 10);
        assert_eq!(admitter.await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_completing_job_times_out() {
        let queue = stuck_queue();
        let ticket = queue.submit(()).unwrap();
        queue.start_up_to_n(1);

        let started = Instant::now();
        assert_timeout(
            queue.await_result(ticket, Duration::from_millis(500)).await,
            TimeoutReason::RunningTime,
        );
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(queue.count_active(), 0);
    }

    #[tokio::test]
    async fn test_zero_timeout_fails_fast() {
        let queue = stuck_queue();
        let ticket = queue.submit(()).unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            queue.await_result(ticket, Duration::ZERO),
        )
        .await
        .expect("await_result must not hang");

        assert_timeout(result, TimeoutReason::QueueWait);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_cancels_running_jobs() {
        let queue = stuck_queue();
        let ticket = queue.submit(()).unwrap();
        queue.submit(()).unwrap();
        queue.start_up_to_n(2);
        assert_eq!(queue.count_active(), 2);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.sweep_expired(Duration::from_secs(1)), 2);
        assert_eq!(queue.count_active(), 0);

        assert_timeout(
            queue.await_result(ticket, Duration::from_secs(1)).await,
            TimeoutReason::Reclaimed,
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_young_jobs() {
        let queue = stuck_queue();
        queue.submit(()).unwrap();
        queue.start_up_to_n(1);

        sleep(Duration::from_millis(100)).await;
        queue.submit(()).unwrap();

        assert_eq!(queue.sweep_expired(Duration::from_secs(10)), 0);
        assert_eq!(queue.count_active(), 1);
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_of_pending_job_wakes_waiter() {
        let queue = Arc::new(stuck_queue());
        let ticket = queue.submit(()).unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.await_result(ticket, Duration::from_secs(60)).await })
        };

        sleep(Duration::from_secs(5)).await;
        assert_eq!(queue.sweep_expired(Duration::from_secs(1)), 1);

        assert_timeout(waiter.await.unwrap(), TimeoutReason::Cancelled);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts_underlying_task() {
        let dropped = Arc::new(AtomicBool::new(false));
        let queue = JobQueue::new("abort", Handle::current(), |flag: Arc<AtomicBool>| {
            async move {
                let _guard = SetOnDrop(flag);
                std::future::pending::<()>().await;
            }
        });

        let ticket = queue.submit(dropped.clone()).unwrap();
        queue.start_up_to_n(1);
        tokio::task::yield_now().await;

        assert!(queue.await_result(ticket, Duration::from_millis(50)).await.is_err());

        for _ in 0..10 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panicking_job_is_reported() {
        let queue = JobQueue::new("panic", Handle::current(), |fail: bool| async move {
            if fail {
                panic!("boom");
            }
        });
        let ticket = queue.submit(true).unwrap();
        queue.start_up_to_n(1);

        let result: Result<()> = queue.await_result(ticket, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::JobPanicked(_))));
    }

    #[tokio::test]
    async fn test_bounded_queue_rejects_when_full() {
        let queue = stuck_queue().with_max_pending(Some(2));
        queue.submit(()).unwrap();
        queue.submit(()).unwrap();

        assert!(matches!(queue.submit(()), Err(Error::QueueFull(2))));

        queue.start_up_to_n(1);
        assert!(queue.submit(()).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_all_empties_queue() {
        let queue = stuck_queue();
        for _ in 0..3 {
            queue.submit(()).unwrap();
        }
        queue.start_up_to_n(1);
        assert!(!queue.is_idle());

        assert_eq!(queue.cancel_all(), 3);
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn test_concurrent_submitters_get_unique_tickets() {
        let queue = Arc::new(doubling_queue());
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    (0..50)
                        .map(|i| queue.submit(i).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
        assert_eq!(queue.pending_count(), total);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticket_is_only_redeemable_on_its_queue() {
        let first = doubling_queue();
        let second = doubling_queue();
        assert_eq!(first.name(), second.name());

        let theirs = first.submit(1).unwrap();
        let ours = second.submit(2).unwrap();
        assert_ne!(theirs, ours);

        assert_timeout(
            second.await_result(theirs, Duration::from_secs(1)).await,
            TimeoutReason::Reclaimed,
        );
        assert_eq!(second.pending_count(), 1);

        first.start_up_to_n(1);
        second.start_up_to_n(1);
        assert_eq!(
            first
                .await_result(theirs, Duration::from_secs(1))
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            second
                .await_result(ours, Duration::from_secs(1))
                .await
                .unwrap(),
            4
        );
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_job_tasks_to_drop() {
        let queue = JobQueue::new("shutdown", Handle::current(), |held: Arc<()>| async move {
            let _held = held;
            std::future::pending::<()>().await;
        });

        let running = Arc::new(());
        let pending = Arc::new(());
        queue.submit(running.clone()).unwrap();
        queue.submit(pending.clone()).unwrap();
        assert_eq!(queue.start_up_to_n(1), 1);

        assert_eq!(queue.shutdown().await, 2);

        // Only the test still holds them once the futures are gone.
        assert_eq!(Arc::strong_count(&running), 1);
        assert_eq!(Arc::strong_count(&pending), 1);
        assert!(queue.is_idle());
    }
}
