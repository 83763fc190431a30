// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Replays test tree diffs and run profiles offline.
//!
//! `testsync replay` applies diff files to an empty test tree and prints the
//! result, `testsync plan` resolves the profile each test would run with, and
//! `testsync show-config` prints the effective config.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
#[doc(hidden)]
pub use output::OutputWriter;
