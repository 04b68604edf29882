// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor records and grading wire types.

mod selector;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use selector::{least_loaded, load_ratio, select_executor};

/// Executor identifier (`executor.id`).
pub type ExecutorId = i64;

/// Auto exercise (grading spec) identifier (`auto_exercise.id`).
pub type SpecId = i64;

/// Executor record stored in the registry.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Executor {
    /// Executor ID
    pub id: ExecutorId,
    /// Human-readable name
    pub name: String,
    /// Base URL, `/v1/grade` is appended for grading calls
    pub base_url: String,
    /// Number of concurrent grading calls the executor accepts
    pub max_load: i32,
    /// Number of grading calls currently in flight
    pub load: i32,
    /// Draining executors receive no new work
    pub drain: bool,
    /// When the executor was registered
    pub created_at: DateTime<Utc>,
}

/// Projection of [`Executor`] for one grading spec, used for a single dispatch decision.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CapableExecutor {
    /// Executor ID
    pub id: ExecutorId,
    /// Human-readable name
    pub name: String,
    /// Base URL
    pub base_url: String,
    /// Current load at read time
    pub load: i32,
    /// Load cap
    pub max_load: i32,
}

/// Grading request posted to `{base_url}/v1/grade`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorRequest {
    /// Student submission
    pub submission: String,
    /// Script the executor runs against the submission
    pub grading_script: String,
    /// Extra files made available to the grading script
    pub assets: Vec<ExecutorRequestAsset>,
    /// Container image to grade in
    pub image_name: String,
    /// Time limit in seconds
    #[serde(rename = "max_time_sec")]
    pub max_time: i32,
    /// Memory limit in megabytes
    #[serde(rename = "max_mem_mb")]
    pub max_mem: i32,
}

/// A file shipped along with a grading request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExecutorRequestAsset {
    /// File name inside the grading container
    pub file_name: String,
    /// File content
    pub file_content: String,
}

/// Result of an automatic assessment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoAssessment {
    /// Grade, 0..=100
    pub grade: i32,
    /// Feedback shown to the student
    pub feedback: String,
}

/// Grading settings of an automatic exercise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoExercise {
    /// Exercise ID
    pub id: SpecId,
    /// Grading script
    pub grading_script: String,
    /// Container image
    pub container_image: String,
    /// Time limit in seconds
    pub max_time: i32,
    /// Memory limit in megabytes
    pub max_mem: i32,
    /// Assets shipped with each request
    pub assets: Vec<ExecutorRequestAsset>,
}

impl AutoExercise {
    /// Build the executor request for a submission.
    pub fn to_request(&self, submission: impl Into<String>) -> ExecutorRequest {
        ExecutorRequest {
            submission: submission.into(),
            grading_script: self.grading_script.clone(),
            assets: self.assets.clone(),
            image_name: self.container_image.clone(),
            max_time: self.max_time,
            max_mem: self.max_mem,
        }
    }
}

/// Queue priority of a grading request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PriorityLevel {
    /// Logged-in students.
    Authenticated,
    /// Anonymous (public) submissions.
    Anonymous,
}

impl PriorityLevel {
    /// All priority levels, in queue order.
    pub const ALL: [PriorityLevel; 2] = [PriorityLevel::Authenticated, PriorityLevel::Anonymous];
}
