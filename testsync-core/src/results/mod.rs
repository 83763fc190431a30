// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Results of test runs.
//!
//! Each run gets a [`LiveTestResult`], which keeps its own small tree of the
//! tests involved in the run. Controllers report per-task states into it, and
//! states are aggregated up that tree the same way the test tree mirror does.
//!
//! [`TestResultService`] keeps the most recent results, newest first.

mod item;
mod live;
mod service;

pub use item::*;
pub use live::*;
pub use service::*;
