// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed executor registry.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, warn};

use super::traits::ExecutorRegistry;
use crate::error::{Error, Result};
use crate::executor::{
    AutoExercise, CapableExecutor, Executor, ExecutorId, ExecutorRequestAsset, SpecId,
};

/// New executor registration.
#[derive(Debug, Clone)]
pub struct NewExecutor {
    /// Human-readable name
    pub name: String,
    /// Base URL
    pub base_url: String,
    /// Load cap
    pub max_load: i32,
    /// Start draining
    pub drain: bool,
    /// Container images the executor can run (must exist)
    pub container_images: Vec<String>,
}

#[derive(sqlx::FromRow)]
struct AutoExerciseRow {
    id: i64,
    grading_script: String,
    container_image_id: String,
    max_time_sec: i32,
    max_mem_mb: i32,
}

/// Executor registry client for PostgreSQL operations.
#[derive(Clone)]
pub struct PgExecutorRegistry {
    pool: PgPool,
}

impl PgExecutorRegistry {
    /// Create a new registry client.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register an executor together with its container images.
    pub async fn register_executor(&self, executor: &NewExecutor) -> Result<ExecutorId> {
        if executor.max_load < 0 {
            return Err(Error::InvalidRequest(format!(
                "max_load must be >= 0, got {}",
                executor.max_load
            )));
        }

        let mut tx = self.pool.begin().await?;

        for image in &executor.container_images {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM container_image WHERE id = $1)")
                    .bind(image)
                    .fetch_one(&mut *tx)
                    .await?;
            if !exists {
                return Err(Error::InvalidRequest(format!(
                    "Container image '{}' not found",
                    image
                )));
            }
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO executor (name, base_url, max_load, drain)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&executor.name)
        .bind(&executor.base_url)
        .bind(executor.max_load)
        .bind(executor.drain)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO executor_container_image (executor_id, container_image_id)
            SELECT $1, UNNEST($2::TEXT[])
            "#,
        )
        .bind(id)
        .bind(executor.container_images.as_slice())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(executor_id = id, name = %executor.name, "Executor registered");
        Ok(id)
    }

    /// Get a full executor record.
    pub async fn get_executor(&self, executor_id: ExecutorId) -> Result<Option<Executor>> {
        let executor = sqlx::query_as::<_, Executor>(
            r#"
            SELECT id, name, base_url, max_load, load, drain, created_at
            FROM executor
            WHERE id = $1
            "#,
        )
        .bind(executor_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(executor)
    }

    /// Set or clear the drain flag.
    pub async fn set_drain(&self, executor_id: ExecutorId, drain: bool) -> Result<()> {
        let result = sqlx::query("UPDATE executor SET drain = $2 WHERE id = $1")
            .bind(executor_id)
            .bind(drain)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::ExecutorNotFound(executor_id));
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutorRegistry for PgExecutorRegistry {
    async fn list_capable_executors(&self, spec_id: SpecId) -> Result<Vec<CapableExecutor>> {
        let executors = sqlx::query_as::<_, CapableExecutor>(
            r#"
            SELECT e.id, e.name, e.base_url, e.load, e.max_load
            FROM auto_exercise ae
            JOIN executor_container_image eci ON eci.container_image_id = ae.container_image_id
            JOIN executor e ON e.id = eci.executor_id
            WHERE ae.id = $1 AND e.drain = FALSE
            ORDER BY e.id
            "#,
        )
        .bind(spec_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(executors)
    }

    async fn increment_load(&self, executor_id: ExecutorId) -> Result<()> {
        let result = sqlx::query("UPDATE executor SET load = load + 1 WHERE id = $1")
            .bind(executor_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::ExecutorNotFound(executor_id));
        }
        Ok(())
    }

    async fn decrement_load(&self, executor_id: ExecutorId) -> Result<()> {
        let result = sqlx::query("UPDATE executor SET load = load - 1 WHERE id = $1 AND load > 0")
            .bind(executor_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            warn!(
                executor_id,
                "Load decrement skipped: executor missing or load already 0"
            );
        }
        Ok(())
    }

    async fn list_executor_ids(&self) -> Result<Vec<ExecutorId>> {
        let ids: Vec<ExecutorId> = sqlx::query_scalar("SELECT id FROM executor ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn max_load(&self, executor_id: ExecutorId) -> Result<Option<i32>> {
        let max_load: Option<i32> = sqlx::query_scalar("SELECT max_load FROM executor WHERE id = $1")
            .bind(executor_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(max_load)
    }

    async fn delete_executor(&self, executor_id: ExecutorId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM executor WHERE id = $1")
            .bind(executor_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn auto_exercise(&self, spec_id: SpecId) -> Result<Option<AutoExercise>> {
        let row = sqlx::query_as::<_, AutoExerciseRow>(
            r#"
            SELECT id, grading_script, container_image_id, max_time_sec, max_mem_mb
            FROM auto_exercise
            WHERE id = $1
            "#,
        )
        .bind(spec_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let assets = sqlx::query_as::<_, ExecutorRequestAsset>(
            r#"
            SELECT file_name, file_content
            FROM asset
            WHERE auto_exercise_id = $1
            ORDER BY id
            "#,
        )
        .bind(spec_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(AutoExercise {
            id: row.id,
            grading_script: row.grading_script,
            container_image: row.container_image_id,
            max_time: row.max_time_sec,
            max_mem: row.max_mem_mb,
            assets,
        }))
    }
}
