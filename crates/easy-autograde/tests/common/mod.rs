// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for easy-autograde database tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};

use sqlx::PgPool;

use easy_autograde::executor::{ExecutorId, SpecId};
use easy_autograde::registry::{NewExecutor, PgExecutorRegistry};

/// Database URL for tests, if configured.
pub fn database_url() -> Option<String> {
    std::env::var("TEST_AUTOGRADE_DATABASE_URL").ok()
}

/// Connect to the test database and apply migrations.
pub async fn get_test_pool() -> Option<PgPool> {
    let pool = PgPool::connect(&database_url()?).await.ok()?;
    easy_autograde::migrations::run(&pool).await.ok()?;
    Some(pool)
}

/// Name that does not collide with other tests running in parallel.
pub fn unique_name(prefix: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!(
        "{}-{}-{}-{}",
        prefix,
        std::process::id(),
        nanos,
        COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

/// Insert a container image.
pub async fn create_image(pool: &PgPool, image: &str) {
    sqlx::query("INSERT INTO container_image (id) VALUES ($1) ON CONFLICT DO NOTHING")
        .bind(image)
        .execute(pool)
        .await
        .expect("Failed to insert container image");
}

/// Insert an auto exercise with one asset.
pub async fn create_exercise(pool: &PgPool, image: &str) -> SpecId {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO auto_exercise (grading_script, container_image_id, max_time_sec, max_mem_mb)
        VALUES ('./grade.sh', $1, 10, 128)
        RETURNING id
        "#,
    )
    .bind(image)
    .fetch_one(pool)
    .await
    .expect("Failed to insert auto exercise");

    sqlx::query(
        "INSERT INTO asset (auto_exercise_id, file_name, file_content) VALUES ($1, 'tests.py', 'assert True')",
    )
    .bind(id)
    .execute(pool)
    .await
    .expect("Failed to insert asset");

    id
}

/// Register an executor capable of `images`.
pub async fn create_executor(
    registry: &PgExecutorRegistry,
    max_load: i32,
    images: &[&str],
) -> ExecutorId {
    registry
        .register_executor(&NewExecutor {
            name: unique_name("executor"),
            base_url: "http://127.0.0.1:1".to_string(),
            max_load,
            drain: false,
            container_images: images.iter().map(|s| s.to_string()).collect(),
        })
        .await
        .expect("Failed to register executor")
}

/// Remove everything created for `image`.
pub async fn cleanup_image(pool: &PgPool, image: &str) {
    sqlx::query(
        "DELETE FROM executor WHERE id IN (SELECT executor_id FROM executor_container_image WHERE container_image_id = $1)",
    )
    .bind(image)
    .execute(pool)
    .await
    .ok();
    sqlx::query("DELETE FROM auto_exercise WHERE container_image_id = $1")
        .bind(image)
        .execute(pool)
        .await
        .ok();
    sqlx::query("DELETE FROM container_image WHERE id = $1")
        .bind(image)
        .execute(pool)
        .await
        .ok();
}
