// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8PathBuf;
use std::error::Error;
use testsync_core::errors::ConfigParseError;
use testsync_metadata::TestSyncExitCode;
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

// The #[error()] strings are placeholders. Errors are printed with
// display_to_stderr.

/// An expected failure, with a documented exit code.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("failed to read input file")]
    InputReadError {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to parse input file")]
    InputParseError {
        path: Utf8PathBuf,
        kind: InputKind,
        #[source]
        err: serde_json::Error,
    },
    #[error("no tests after replay")]
    NoTests,
    #[error("unknown test")]
    UnknownTest { test_id: String },
    #[error("failed to write output")]
    WriteOutputError {
        #[from]
        err: std::io::Error,
    },
    #[error("failed to serialize output")]
    SerializeError {
        #[source]
        err: serde_json::Error,
    },
}

/// The kind of a JSON input file.
#[derive(Clone, Copy, Debug)]
#[doc(hidden)]
pub enum InputKind {
    Diff,
    Profiles,
}

impl InputKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Diff => "diff",
            Self::Profiles => "profiles",
        }
    }
}

impl ExpectedError {
    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::ConfigParseError { .. } => TestSyncExitCode::SETUP_ERROR,
            Self::InputReadError { .. }
            | Self::InputParseError { .. }
            | Self::UnknownTest { .. } => TestSyncExitCode::INPUT_ERROR,
            Self::NoTests => TestSyncExitCode::NO_TESTS,
            Self::WriteOutputError { .. } | Self::SerializeError { .. } => {
                TestSyncExitCode::WRITE_OUTPUT_ERROR
            }
        }
    }

    /// Displays this error to stderr, followed by its chain of causes.
    pub fn display_to_stderr(&self) {
        let mut next_error = match self {
            Self::ConfigParseError { err } => {
                error!("failed to parse config at `{}`", err.config_file());
                err.source()
            }
            Self::InputReadError { path, err } => {
                error!("failed to read `{path}`");
                Some(err as &dyn Error)
            }
            Self::InputParseError { path, kind, err } => {
                error!("failed to parse {} file `{path}`", kind.as_str());
                Some(err as &dyn Error)
            }
            Self::NoTests => {
                error!("no tests are left in the tree after replaying");
                None
            }
            Self::UnknownTest { test_id } => {
                error!("test `{}` is not in the tree", test_id.escape_debug());
                None
            }
            Self::WriteOutputError { err } => {
                error!("failed to write output");
                Some(err as &dyn Error)
            }
            Self::SerializeError { err } => {
                error!("failed to serialize output");
                Some(err as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            error!("caused by: {err}");
            next_error = err.source();
        }
    }
}
