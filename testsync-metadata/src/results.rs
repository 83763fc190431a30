// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::collection::Location;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fmt;

/// The result state of a test, either for a single task or aggregated.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestResultState {
    /// No result has been recorded.
    #[default]
    Unset,

    /// The test is waiting to run.
    Queued,

    /// The test is running.
    Running,

    /// The test passed.
    Passed,

    /// The test failed an assertion.
    Failed,

    /// The test was skipped.
    Skipped,

    /// The test could not be run, e.g. because of a compile error.
    Errored,
}

impl TestResultState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Unset,
        Self::Queued,
        Self::Running,
        Self::Passed,
        Self::Failed,
        Self::Skipped,
        Self::Errored,
    ];

    /// Returns the aggregation priority of this state. When states are
    /// combined, the one with the highest priority wins.
    pub fn priority(self) -> u8 {
        match self {
            Self::Skipped => 0,
            Self::Unset => 1,
            Self::Passed => 2,
            Self::Queued => 3,
            Self::Failed => 4,
            Self::Errored => 5,
            Self::Running => 6,
        }
    }

    /// Returns whichever of the two states has the higher priority.
    pub fn max_priority(self, other: Self) -> Self {
        if other.priority() > self.priority() {
            other
        } else {
            self
        }
    }

    /// Returns the ordering among terminal states, or `None` if this state is
    /// not terminal.
    ///
    /// A task's result for a test may only move to a terminal state that is at
    /// least as severe as the current one.
    pub fn terminal_priority(self) -> Option<u8> {
        match self {
            Self::Passed => Some(0),
            Self::Skipped => Some(1),
            Self::Failed => Some(2),
            Self::Errored => Some(3),
            Self::Unset | Self::Queued | Self::Running => None,
        }
    }

    /// Returns true if this state is a verdict.
    pub fn is_terminal(self) -> bool {
        self.terminal_priority().is_some()
    }

    /// Returns a static string for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for TestResultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Combines a set of states by priority. An empty set is
/// [`TestResultState::Unset`].
pub fn max_priority(states: impl IntoIterator<Item = TestResultState>) -> TestResultState {
    states
        .into_iter()
        .fold(TestResultState::Unset, TestResultState::max_priority)
}

/// A message attached to a test result.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TestMessage {
    /// A failure, optionally with expected and actual values.
    Error {
        /// The failure message.
        message: String,

        /// The expected value, for assertion failures.
        #[serde(default)]
        expected: Option<String>,

        /// The actual value, for assertion failures.
        #[serde(default)]
        actual: Option<String>,

        /// Where the failure happened.
        #[serde(default)]
        location: Option<Location>,
    },

    /// Output produced while the test ran.
    Output {
        /// The output text.
        message: String,

        /// Byte offset of this output within the task's output stream.
        offset: u64,

        /// Where the output was produced.
        #[serde(default)]
        location: Option<Location>,
    },
}

impl TestMessage {
    /// Creates an error message with no expected/actual values or location.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            expected: None,
            actual: None,
            location: None,
        }
    }

    /// Returns the message text.
    pub fn message(&self) -> &str {
        match self {
            Self::Error { message, .. } | Self::Output { message, .. } => message,
        }
    }
}

/// A task within a test run, as reported by a controller.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestRunTask {
    /// The task ID, unique within the run.
    pub id: SmolStr,

    /// Human-readable name.
    #[serde(default)]
    pub name: Option<String>,

    /// True while the task is running.
    pub running: bool,
}

impl TestRunTask {
    /// Creates a new running task.
    pub fn new(id: impl Into<SmolStr>) -> Self {
        Self {
            id: id.into(),
            name: None,
            running: true,
        }
    }
}

#[cfg(feature = "proptest1")]
mod proptest_impls {
    use super::TestResultState;
    use proptest::prelude::*;

    impl Arbitrary for TestResultState {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(_: ()) -> Self::Strategy {
            proptest::sample::select(TestResultState::ALL.to_vec()).boxed()
        }
    }
}
