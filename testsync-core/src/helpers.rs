// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! General support code for testsync-core.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Utilities for pluralizing various words based on count or plurality.
pub mod plural {
    /// Returns "test" if `count` is 1, otherwise "tests".
    pub fn tests_str(count: usize) -> &'static str {
        if count == 1 { "test" } else { "tests" }
    }

    /// Returns "controller" if `count` is 1, otherwise "controllers".
    pub fn controllers_str(count: usize) -> &'static str {
        if count == 1 {
            "controller"
        } else {
            "controllers"
        }
    }
}

/// Locks a mutex, recovering the guard if another thread panicked while
/// holding it.
///
/// None of the state guarded in this crate is left half-written across a
/// panic point, so the data is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
