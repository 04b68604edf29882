// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory executor registry for testing.
//!
//! Keeps executors and exercises in process memory. Load updates happen
//! under a single mutex, so they are atomic in the same sense the
//! PostgreSQL `UPDATE ... SET load = load + 1` is.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use super::traits::ExecutorRegistry;
use crate::error::{Error, Result};
use crate::executor::{AutoExercise, CapableExecutor, ExecutorId, SpecId};

#[derive(Debug, Clone)]
struct MemoryExecutor {
    name: String,
    base_url: String,
    load: i32,
    max_load: i32,
    drain: bool,
    container_images: Vec<String>,
}

#[derive(Default)]
struct State {
    executors: BTreeMap<ExecutorId, MemoryExecutor>,
    exercises: BTreeMap<SpecId, AutoExercise>,
}

/// In-memory registry.
#[derive(Default)]
pub struct MemoryExecutorRegistry {
    state: Mutex<State>,
}

impl MemoryExecutorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an executor.
    pub async fn add_executor(
        &self,
        id: ExecutorId,
        base_url: &str,
        max_load: i32,
        container_images: &[&str],
    ) {
        let mut state = self.state.lock().await;
        state.executors.insert(
            id,
            MemoryExecutor {
                name: format!("executor-{}", id),
                base_url: base_url.to_string(),
                load: 0,
                max_load,
                drain: false,
                container_images: container_images.iter().map(|s| s.to_string()).collect(),
            },
        );
    }

    /// Add or replace an exercise.
    pub async fn add_exercise(&self, exercise: AutoExercise) {
        let mut state = self.state.lock().await;
        state.exercises.insert(exercise.id, exercise);
    }

    /// Set the drain flag of an executor.
    pub async fn set_drain(&self, id: ExecutorId, drain: bool) {
        let mut state = self.state.lock().await;
        if let Some(executor) = state.executors.get_mut(&id) {
            executor.drain = drain;
        }
    }

    /// Overwrite the current load of an executor.
    pub async fn set_load(&self, id: ExecutorId, load: i32) {
        let mut state = self.state.lock().await;
        if let Some(executor) = state.executors.get_mut(&id) {
            executor.load = load;
        }
    }

    /// Current load of an executor.
    pub async fn load(&self, id: ExecutorId) -> Option<i32> {
        let state = self.state.lock().await;
        state.executors.get(&id).map(|e| e.load)
    }
}

#[async_trait]
impl ExecutorRegistry for MemoryExecutorRegistry {
    async fn list_capable_executors(&self, spec_id: SpecId) -> Result<Vec<CapableExecutor>> {
        let state = self.state.lock().await;
        let Some(exercise) = state.exercises.get(&spec_id) else {
            return Ok(Vec::new());
        };

        Ok(state
            .executors
            .iter()
            .filter(|(_, e)| !e.drain && e.container_images.contains(&exercise.container_image))
            .map(|(id, e)| CapableExecutor {
                id: *id,
                name: e.name.clone(),
                base_url: e.base_url.clone(),
                load: e.load,
                max_load: e.max_load,
            })
            .collect())
    }

    async fn increment_load(&self, executor_id: ExecutorId) -> Result<()> {
        let mut state = self.state.lock().await;
        let executor = state
            .executors
            .get_mut(&executor_id)
            .ok_or(Error::ExecutorNotFound(executor_id))?;
        executor.load += 1;
        Ok(())
    }

    async fn decrement_load(&self, executor_id: ExecutorId) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(executor) = state.executors.get_mut(&executor_id)
            && executor.load > 0
        {
            executor.load -= 1;
        }
        Ok(())
    }

    async fn list_executor_ids(&self) -> Result<Vec<ExecutorId>> {
        let state = self.state.lock().await;
        Ok(state.executors.keys().copied().collect())
    }

    async fn max_load(&self, executor_id: ExecutorId) -> Result<Option<i32>> {
        let state = self.state.lock().await;
        Ok(state.executors.get(&executor_id).map(|e| e.max_load))
    }

    async fn delete_executor(&self, executor_id: ExecutorId) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.executors.remove(&executor_id).is_some())
    }

    async fn auto_exercise(&self, spec_id: SpecId) -> Result<Option<AutoExercise>> {
        let state = self.state.lock().await;
        Ok(state.exercises.get(&spec_id).cloned())
    }
}
