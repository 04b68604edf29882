// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for easy-autograde.

use std::fmt;

use thiserror::Error;

use crate::executor::ExecutorId;

/// Why a ticket wait ended without a result.
///
/// Callers only ever see [`Error::AwaitTimeout`]; the reason is kept for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    /// The job was still pending when the wait budget ran out.
    QueueWait,
    /// The job was running when the wait budget ran out.
    RunningTime,
    /// The job's task was cancelled, usually by the timeout sweep.
    Cancelled,
    /// The ticket is unknown or its state was already reclaimed.
    Reclaimed,
}

impl fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            TimeoutReason::QueueWait => "timeout in queue",
            TimeoutReason::RunningTime => "job reached maximum allowed running time",
            TimeoutReason::Cancelled => "job was cancelled",
            TimeoutReason::Reclaimed => "ticket already reclaimed",
        };
        f.write_str(reason)
    }
}

/// Autograde errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No executor is capable of grading this exercise.
    #[error("No capable executors found for this auto exercise")]
    NoExecutorsAvailable,

    /// Even the least loaded capable executor is at its load cap.
    #[error("All capable executors at max load (best candidate: executor {executor_id}, load {load}/{max_load})")]
    AllExecutorsOverloaded {
        /// Executor that was selected as the best candidate.
        executor_id: ExecutorId,
        /// Its load at selection time.
        load: i32,
        /// Its load cap.
        max_load: i32,
    },

    /// The remote grading call failed.
    #[error("Executor error ({})", call_failure_detail(.status, .message))]
    ExecutorCallFailed {
        /// Upstream HTTP status, when a response was received.
        status: Option<u16>,
        /// Details of the failure.
        message: String,
    },

    /// Waiting on a ticket did not produce a result.
    #[error("Scheduled job has been cancelled due to timeout. Reason: {0}")]
    AwaitTimeout(TimeoutReason),

    /// The row lock is already held.
    #[error("Resource is locked")]
    ResourceLocked,

    /// A bounded pending queue is full.
    #[error("Job queue is full ({0} pending)")]
    QueueFull(usize),

    /// A job panicked while running.
    #[error("Job panicked: {0}")]
    JobPanicked(String),

    /// Executor was not found.
    #[error("Executor with id {0} not found")]
    ExecutorNotFound(ExecutorId),

    /// Entity referenced by a row lock or exercise lookup was not found.
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::ExecutorCallFailed {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

fn call_failure_detail(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(code) => code.to_string(),
        None => message.to_string(),
    }
}

/// Result type using autograde Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_call_failed_prefers_status() {
        let err = Error::ExecutorCallFailed {
            status: Some(502),
            message: "bad gateway".to_string(),
        };
        assert_eq!(err.to_string(), "Executor error (502)");

        let err = Error::ExecutorCallFailed {
            status: None,
            message: "empty body".to_string(),
        };
        assert_eq!(err.to_string(), "Executor error (empty body)");
    }

    #[test]
    fn test_await_timeout_message_carries_reason() {
        let err = Error::AwaitTimeout(TimeoutReason::QueueWait);
        assert!(err.to_string().ends_with("Reason: timeout in queue"));
    }
}
