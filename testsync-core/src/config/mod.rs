// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for testsync.
//!
//! The configuration is a TOML file, by default at `.config/testsync.toml`
//! under a root directory. It is layered on top of an embedded default
//! config, so every key is optional.

mod imp;

pub use imp::*;
