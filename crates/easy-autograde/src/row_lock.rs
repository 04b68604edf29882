// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Try-lock stored in a boolean column of a single database row.
//!
//! `TRUE` means held, `FALSE` (or `NULL`) means free. Locks on different rows
//! are independent. Acquisition never waits: a held lock fails with
//! [`Error::ResourceLocked`].
//!
//! ```ignore
//! let lock = RowLock::new(pool, "course", "id", "moodle_sync_grades_in_progress")?;
//! lock.with_lock(course_id, || async { sync_grades(course_id).await }).await?;
//! ```

use std::future::Future;

use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Check that `name` can be spliced into SQL as a plain identifier.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!(
            "'{}' is not a valid SQL identifier",
            name
        )))
    }
}

/// A database-backed per-row try-lock.
pub struct RowLock {
    pool: PgPool,
    table: String,
    acquire_sql: String,
    release_sql: String,
    release_all_sql: String,
    exists_sql: String,
    is_locked_sql: String,
    guard: Mutex<()>,
}

impl RowLock {
    /// Create a lock over `table.lock_column`, rows addressed by `id_column`.
    pub fn new(pool: PgPool, table: &str, id_column: &str, lock_column: &str) -> Result<Self> {
        validate_identifier(table)?;
        validate_identifier(id_column)?;
        validate_identifier(lock_column)?;

        Ok(Self {
            pool,
            table: table.to_string(),
            acquire_sql: format!(
                "UPDATE {table} SET {lock_column} = TRUE WHERE {id_column} = $1 AND {lock_column} IS NOT TRUE"
            ),
            release_sql: format!("UPDATE {table} SET {lock_column} = FALSE WHERE {id_column} = $1"),
            release_all_sql: format!("UPDATE {table} SET {lock_column} = FALSE"),
            exists_sql: format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE {id_column} = $1)"),
            is_locked_sql: format!(
                "SELECT COALESCE({lock_column}, FALSE) FROM {table} WHERE {id_column} = $1"
            ),
            guard: Mutex::new(()),
        })
    }

    /// Table this lock lives in.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Run `critical_section` while holding the lock for `entity_id`.
    ///
    /// Fails with [`Error::ResourceLocked`] if the row is already locked and
    /// [`Error::EntityNotFound`] if there is no such row. The lock is released
    /// however the critical section ends, including the future being dropped.
    /// Once the critical section has run its result is always returned; a
    /// failed release is logged and leaves the row for [`release_all`](Self::release_all).
    pub async fn with_lock<F, Fut, R>(&self, entity_id: i64, critical_section: F) -> Result<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let held = self.try_acquire(entity_id).await?;

        let result = critical_section().await;

        held.release().await;
        Ok(result)
    }

    async fn try_acquire(&self, entity_id: i64) -> Result<HeldRowLock> {
        let _guard = self.guard.lock().await;

        let acquired = sqlx::query(&self.acquire_sql)
            .bind(entity_id)
            .execute(&self.pool)
            .await?
            .rows_affected()
            > 0;

        if acquired {
            debug!(table = %self.table, entity_id, "Row lock acquired");
            return Ok(HeldRowLock {
                pool: self.pool.clone(),
                release_sql: self.release_sql.clone(),
                table: self.table.clone(),
                entity_id,
                held: true,
            });
        }

        let exists: bool = sqlx::query_scalar(&self.exists_sql)
            .bind(entity_id)
            .fetch_one(&self.pool)
            .await?;

        if exists {
            debug!(table = %self.table, entity_id, "Row lock is held elsewhere");
            Err(Error::ResourceLocked)
        } else {
            Err(Error::EntityNotFound(format!(
                "{} with id {}",
                self.table, entity_id
            )))
        }
    }

    /// Whether the row is currently locked.
    pub async fn is_locked(&self, entity_id: i64) -> Result<bool> {
        let locked: Option<bool> = sqlx::query_scalar(&self.is_locked_sql)
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await?;

        locked.ok_or_else(|| Error::EntityNotFound(format!("{} with id {}", self.table, entity_id)))
    }

    /// Force every row of the table to unlocked.
    ///
    /// Only for startup and shutdown recovery. Calling this while holders are
    /// active breaks their mutual exclusion.
    pub async fn release_all(&self) -> Result<u64> {
        let _guard = self.guard.lock().await;

        let released = sqlx::query(&self.release_all_sql)
            .execute(&self.pool)
            .await?
            .rows_affected();

        info!(table = %self.table, rows = released, "Released all row locks");
        Ok(released)
    }
}

/// An acquired row lock. Dropping it while held releases in the background.
struct HeldRowLock {
    pool: PgPool,
    release_sql: String,
    table: String,
    entity_id: i64,
    held: bool,
}

impl HeldRowLock {
    async fn release(mut self) {
        self.held = false;
        if let Err(e) = self.spawn_release().await {
            error!(
                table = %self.table,
                entity_id = self.entity_id,
                error = %e,
                "Row lock release task failed"
            );
        }
    }

    fn spawn_release(&self) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let sql = self.release_sql.clone();
        let table = self.table.clone();
        let entity_id = self.entity_id;

        tokio::spawn(async move {
            match sqlx::query(&sql).bind(entity_id).execute(&pool).await {
                Ok(_) => debug!(table = %table, entity_id, "Row lock released"),
                Err(e) => {
                    error!(table = %table, entity_id, error = %e, "Failed to release row lock")
                }
            }
        })
    }
}

impl Drop for HeldRowLock {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            warn!(
                table = %self.table,
                entity_id = self.entity_id,
                "Critical section dropped while holding row lock, releasing in background"
            );
            self.spawn_release();
        } else {
            error!(
                table = %self.table,
                entity_id = self.entity_id,
                "Row lock dropped outside a runtime, left held"
            );
        }
    }
}
