// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by testsync.

use camino::Utf8PathBuf;
use config::ConfigError;
use smol_str::SmolStr;
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse testsync config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    kind: ConfigParseErrorKind,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, kind: ConfigParseErrorKind) -> Self {
        Self {
            config_file: config_file.into(),
            kind,
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }

    /// Returns the kind of error this is.
    pub fn kind(&self) -> &ConfigParseErrorKind {
        &self.kind
    }
}

/// The kind of error that occurred while parsing a config.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigParseErrorKind {
    /// An error occurred while building the config.
    #[error(transparent)]
    BuildError(Box<ConfigError>),

    /// An error occurred while deserializing the config.
    #[error(transparent)]
    DeserializeError(Box<serde_path_to_error::Error<ConfigError>>),
}

/// An error returned by a [`TestController`](crate::controller::TestController).
///
/// This is `Clone` so that a single in-flight expansion can hand the same
/// outcome to every caller waiting on it.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ControllerError {
    /// The controller observed the cancellation token and stopped.
    #[error("controller operation was cancelled")]
    Cancelled,

    /// The controller failed.
    #[error("controller operation failed: {message}")]
    Failed {
        /// A description of the failure.
        message: String,
    },
}

impl ControllerError {
    /// Creates a new `Failed` error.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// An error that occurred while expanding a test.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum ExpandTestError {
    /// No controller is registered for the test's controller ID.
    #[error("no controller `{controller_id}` is registered to expand `{}`", .test_id.escape_debug())]
    UnknownController {
        /// The controller ID recovered from the test ID.
        controller_id: SmolStr,

        /// The test that was being expanded.
        test_id: SmolStr,
    },

    /// The controller failed to expand the test.
    #[error("controller `{controller_id}` failed to expand test")]
    Controller {
        /// The controller that failed.
        controller_id: SmolStr,

        /// The underlying error.
        #[source]
        error: ControllerError,
    },
}

/// An error that occurred while opening a profile's configuration.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum ProfileConfigureError {
    /// No controller is registered with this ID.
    #[error("no controller `{controller_id}` is registered")]
    UnknownController {
        /// The controller ID.
        controller_id: SmolStr,
    },

    /// The controller has no profile with this ID.
    #[error("controller `{controller_id}` has no profile {profile_id}")]
    UnknownProfile {
        /// The controller ID.
        controller_id: SmolStr,

        /// The profile ID.
        profile_id: u32,
    },

    /// The profile doesn't declare a configuration handler.
    #[error("profile {profile_id} of controller `{controller_id}` is not configurable")]
    NotConfigurable {
        /// The controller ID.
        controller_id: SmolStr,

        /// The profile ID.
        profile_id: u32,
    },
}

/// A misuse of a [`LiveTestResult`](crate::results::LiveTestResult).
///
/// These indicate bugs in the caller, rather than stale data: updates for a
/// test that isn't part of the run are silently ignored instead.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum LiveResultError {
    /// A task ID was referenced that was never added to the run.
    #[error("unknown task `{task_id}` in run")]
    UnknownTask {
        /// The task ID.
        task_id: SmolStr,
    },

    /// `mark_complete` was called on a run that was already complete.
    #[error("cannot complete a test run more than once")]
    AlreadyCompleted,
}
