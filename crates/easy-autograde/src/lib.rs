// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Easy Autograde - Load-Capped Automatic Grading Dispatch
//!
//! This crate dispatches automatic-grading requests to a pool of remote
//! grading executors. It handles executor selection under a load cap,
//! load accounting that survives cancellation, a ticket-addressed job queue
//! with externally driven admission, and a database-backed per-row try-lock
//! for long-running maintenance jobs.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Callers (submissions)                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ submit_and_await
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        AutoGradeScheduler                               │
//! │  ┌───────────────────────┐   ┌───────────────────────┐                  │
//! │  │ executor 1            │   │ executor 2            │   ...            │
//! │  │  JobQueue (auth)      │   │  JobQueue (auth)      │                  │
//! │  │  JobQueue (anonymous) │   │  JobQueue (anonymous) │                  │
//! │  └───────────────────────┘   └───────────────────────┘                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//!        ▲                           │                          ▲
//!   admit│ (AdmissionWorker)         │ call_selected       sweep│ (SweepWorker)
//!                                    ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────────────────┐
//! │   ExecutorRegistry       │   │   GradingClient                          │
//! │   load +1 / -1 (atomic)  │   │   POST {base_url}/v1/grade               │
//! └──────────────────────────┘   └──────────────────────────────────────────┘
//!              │                                   │
//!              ▼                                   ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────────────────┐
//! │       PostgreSQL         │   │         Grading executors (HTTP)         │
//! └──────────────────────────┘   └──────────────────────────────────────────┘
//! ```
//!
//! # Job Lifecycle
//!
//! ```text
//!   submit ──► PENDING ──admit──► RUNNING ──► RESOLVED
//!                 │                  │
//!                 └── sweep/timeout ─┴──► TIMED OUT | CANCELLED
//! ```
//!
//! A ticket is redeemed exactly once. Timing out or sweeping a running job
//! aborts its task, and the executor's load slot is released by the task's
//! [`LoadGuard`](dispatch::LoadGuard).
//!
//! # Errors
//!
//! | Error | Raised by |
//! |-------|-----------|
//! | `NoExecutorsAvailable` | selection over an empty candidate set |
//! | `AllExecutorsOverloaded` | direct dispatch to a saturated best executor |
//! | `ExecutorCallFailed` | non-2xx, empty or unparseable executor response |
//! | `AwaitTimeout` | ticket wait exceeded, job cancelled or ticket reclaimed |
//! | `ResourceLocked` | row lock already held |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `AUTOGRADE_DATABASE_URL` | Yes* | - | PostgreSQL connection string |
//! | `DATABASE_URL` | Yes* | - | Fallback if above not set |
//! | `AUTOGRADE_DB_MAX_CONNECTIONS` | No | `10` | Pool size |
//! | `AUTOGRADE_ADMISSION_INTERVAL_MS` | No | `1000` | Delay between admission ticks |
//! | `AUTOGRADE_SWEEP_INTERVAL_SECS` | No | `60` | Delay between timeout sweeps |
//! | `AUTOGRADE_MAX_RUNNING_MS` | No | `3600000` | Age after which a job is swept |
//! | `AUTOGRADE_USER_WAIT_MS` | No | `300000` | How long a caller waits on a ticket |
//! | `AUTOGRADE_EXECUTOR_REQUEST_TIMEOUT_SECS` | No | `3600` | Executor HTTP timeout |
//! | `AUTOGRADE_MAX_PENDING` | No | unbounded | Pending depth per queue |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types
//! - [`executor`]: Executor records, wire types and selection
//! - [`registry`]: Executor registry (PostgreSQL and in-memory)
//! - [`client`]: Remote grading client (HTTP and mock)
//! - [`dispatch`]: Load-accounted grading calls
//! - [`queue`]: Ticket-addressed job queue
//! - [`scheduler`]: Per-executor, per-priority scheduling
//! - [`admission_worker`]: Periodic admission driver
//! - [`sweep_worker`]: Periodic timeout sweep
//! - [`row_lock`]: Database-backed per-row try-lock
//! - [`runtime`]: Embeddable runtime

#![deny(missing_docs)]

/// Database migrations for the executor registry.
pub mod migrations;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for autograde operations.
pub mod error;

/// Executor records, grading wire types and executor selection.
pub mod executor;

/// Executor registry backends.
pub mod registry;

/// Remote grading clients.
pub mod client;

/// Load-accounted dispatch to executors.
pub mod dispatch;

/// Ticket-addressed asynchronous job queue.
pub mod queue;

/// Auto-grade scheduler with per-executor priority queues.
pub mod scheduler;

/// Background worker admitting queued grading jobs.
pub mod admission_worker;

/// Background worker cancelling expired grading jobs.
pub mod sweep_worker;

/// Database-backed per-row try-lock.
pub mod row_lock;

/// Embeddable runtime for easy-autograde.
pub mod runtime;

pub use config::Config;
pub use error::{Error, Result};
