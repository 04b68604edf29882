// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor registry trait definitions.

use async_trait::async_trait;

use crate::error::Result;
use crate::executor::{AutoExercise, CapableExecutor, ExecutorId, SpecId};

/// Persistent set of executors and the exercises they can grade.
///
/// Load counters are only changed through [`increment_load`](Self::increment_load)
/// and [`decrement_load`](Self::decrement_load), which must be atomic in the
/// backing store. Implementations never read-modify-write a counter in memory.
#[async_trait]
pub trait ExecutorRegistry: Send + Sync {
    /// Executors that can grade `spec_id`, excluding draining ones.
    async fn list_capable_executors(&self, spec_id: SpecId) -> Result<Vec<CapableExecutor>>;

    /// Atomically add one to the executor's load.
    async fn increment_load(&self, executor_id: ExecutorId) -> Result<()>;

    /// Atomically subtract one from the executor's load, never going below zero.
    async fn decrement_load(&self, executor_id: ExecutorId) -> Result<()>;

    /// IDs of every registered executor, draining ones included.
    async fn list_executor_ids(&self) -> Result<Vec<ExecutorId>>;

    /// Load cap of an executor, `None` if it does not exist.
    async fn max_load(&self, executor_id: ExecutorId) -> Result<Option<i32>>;

    /// Remove an executor. Returns false if it did not exist.
    async fn delete_executor(&self, executor_id: ExecutorId) -> Result<bool>;

    /// Grading settings of an automatic exercise.
    async fn auto_exercise(&self, spec_id: SpecId) -> Result<Option<AutoExercise>>;
}
