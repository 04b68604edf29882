// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Least-loaded executor selection.

use super::CapableExecutor;
use crate::error::{Error, Result};

/// Load ratio `load / max_load`. An executor without capacity is always saturated.
pub fn load_ratio(executor: &CapableExecutor) -> f64 {
    if executor.max_load <= 0 {
        return f64::INFINITY;
    }
    f64::from(executor.load) / f64::from(executor.max_load)
}

/// The candidate with the lowest load ratio, first one on ties.
pub fn least_loaded<'a, I>(candidates: I) -> Option<&'a CapableExecutor>
where
    I: IntoIterator<Item = &'a CapableExecutor>,
{
    let mut best: Option<(&CapableExecutor, f64)> = None;

    for candidate in candidates {
        let ratio = load_ratio(candidate);
        match best {
            Some((_, best_ratio)) if ratio >= best_ratio => {}
            _ => best = Some((candidate, ratio)),
        }
    }

    best.map(|(executor, _)| executor)
}

/// Pick the executor with the lowest load ratio.
///
/// Ties go to the first candidate encountered. The candidates must already
/// exclude draining executors. Has no side effects, so it is safe to retry.
pub fn select_executor<'a, I>(candidates: I) -> Result<&'a CapableExecutor>
where
    I: IntoIterator<Item = &'a CapableExecutor>,
{
    let executor = least_loaded(candidates).ok_or(Error::NoExecutorsAvailable)?;

    if executor.load >= executor.max_load {
        return Err(Error::AllExecutorsOverloaded {
            executor_id: executor.id,
            load: executor.load,
            max_load: executor.max_load,
        });
    }

    Ok(executor)
}
