// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote grading client - the call into a chosen executor.

pub mod http;
pub mod mock;

use async_trait::async_trait;

use crate::error::Result;
use crate::executor::{AutoAssessment, CapableExecutor, ExecutorRequest};

pub use http::HttpGradingClient;
pub use mock::MockGradingClient;

/// Path appended to an executor's base URL for grading calls.
pub const EXECUTOR_GRADE_PATH: &str = "/v1/grade";

/// Trait for grading clients.
///
/// Clients are PURE transport - they do NOT touch executor load.
/// Load accounting is handled by the caller.
#[async_trait]
pub trait GradingClient: Send + Sync {
    /// Grade one submission on `executor`.
    ///
    /// Non-2xx responses and empty or unparseable bodies fail with
    /// [`Error::ExecutorCallFailed`](crate::Error::ExecutorCallFailed).
    async fn grade(
        &self,
        executor: &CapableExecutor,
        request: &ExecutorRequest,
    ) -> Result<AutoAssessment>;
}
