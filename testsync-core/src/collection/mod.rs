// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test tree mirror.
//!
//! Controllers describe their tests as batches of
//! [`TestsDiffOp`](testsync_metadata::TestsDiffOp)s. [`TestCollection`] replays
//! those batches into a single tree and reports what changed, one
//! [`CollectionChangeSet`] per batch.
//!
//! Trees can be very large, so controllers usually publish only the top levels
//! and mark deeper tests as expandable. [`TestCollection::expand`] asks the
//! owning controller for more, sharing a single in-flight request between
//! everyone interested in the same test.

mod expand;
mod imp;

pub use expand::ExpandFuture;
pub use imp::*;
