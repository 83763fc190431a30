// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Wire types exchanged between test controllers and the testsync core.
//!
//! Controllers describe their tests as [`TestsDiffOp`] batches, are asked to
//! run tests through [`RunTestForControllerRequest`]s, and address tests by
//! composite [`TestId`]s.

mod collection;
mod errors;
mod exit_codes;
mod profile;
mod results;
mod run_id;
mod test_id;

pub use collection::*;
pub use errors::*;
pub use exit_codes::*;
pub use profile::*;
pub use results::*;
pub use run_id::*;
pub use test_id::*;
