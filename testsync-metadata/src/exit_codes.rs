// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `testsync` failures.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum TestSyncExitCode {}

impl TestSyncExitCode {
    /// No errors occurred and testsync exited normally.
    pub const OK: i32 = 0;

    /// A replayed diff left no tests in the tree.
    pub const NO_TESTS: i32 = 4;

    /// Loading the config failed.
    pub const SETUP_ERROR: i32 = 96;

    /// An input file could not be read or parsed.
    pub const INPUT_ERROR: i32 = 97;

    /// Writing output produced an error.
    pub const WRITE_OUTPUT_ERROR: i32 = 110;
}
