// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Test tree mirroring, run orchestration and result aggregation for test
//! explorers.
//!
//! Test controllers describe their tests as diffs, which [`service::TestService`]
//! applies to a [`collection::TestCollection`]. Run requests are resolved
//! against the [`profiles::TestProfileRegistry`] and dispatched to the
//! controllers, which report progress into a [`results::LiveTestResult`].
//!
//! Both the test tree and each result aggregate states from children to
//! parents through [`computed_state`].

pub mod collection;
pub mod computed_state;
pub mod config;
pub mod controller;
pub mod errors;
mod helpers;
pub mod profiles;
pub mod results;
pub mod service;
mod time;
