// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor registry - where executors, their load and their capabilities live.

pub mod memory;
pub mod postgres;
mod traits;

pub use memory::MemoryExecutorRegistry;
pub use postgres::{NewExecutor, PgExecutorRegistry};
pub use traits::*;
