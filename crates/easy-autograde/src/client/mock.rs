// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock grading client for testing.
//!
//! Simulates executor calls without any network traffic.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use super::GradingClient;
use crate::error::{Error, Result};
use crate::executor::{AutoAssessment, CapableExecutor, ExecutorId, ExecutorRequest};

/// Mock grading client.
pub struct MockGradingClient {
    /// Simulated grading time (in milliseconds)
    pub execution_delay_ms: u64,
    /// If true, every call fails with a 500 status
    pub fail_by_default: bool,
    /// If true, calls never return. Useful for testing timeouts and cancellation.
    pub never_complete: bool,
    calls: Mutex<Vec<ExecutorId>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Default for MockGradingClient {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockGradingClient {
    /// Create a mock client that grades everything 100.
    pub fn new() -> Self {
        Self {
            execution_delay_ms: 10,
            fail_by_default: false,
            never_complete: false,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Create a mock client whose calls always fail.
    pub fn failing() -> Self {
        Self {
            fail_by_default: true,
            ..Self::new()
        }
    }

    /// Create a mock client that takes `ms` milliseconds per call.
    pub fn with_delay(ms: u64) -> Self {
        Self {
            execution_delay_ms: ms,
            ..Self::new()
        }
    }

    /// Create a mock client whose calls never complete.
    pub fn never_completing() -> Self {
        Self {
            execution_delay_ms: 0,
            never_complete: true,
            ..Self::new()
        }
    }

    /// Executors called so far, in call order.
    pub async fn calls(&self) -> Vec<ExecutorId> {
        self.calls.lock().await.clone()
    }

    /// Calls currently in progress.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GradingClient for MockGradingClient {
    async fn grade(
        &self,
        executor: &CapableExecutor,
        request: &ExecutorRequest,
    ) -> Result<AutoAssessment> {
        self.calls.lock().await.push(executor.id);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        if self.never_complete {
            std::future::pending::<()>().await;
        }

        if self.execution_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.execution_delay_ms)).await;
        }

        if self.fail_by_default {
            return Err(Error::ExecutorCallFailed {
                status: Some(500),
                message: "Mock failure".to_string(),
            });
        }

        Ok(AutoAssessment {
            grade: 100,
            feedback: format!("graded by {}: {}", executor.name, request.submission),
        })
    }
}
