// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

mod fixtures;
mod runs;
mod tree;
