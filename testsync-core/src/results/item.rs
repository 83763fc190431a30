// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use smol_str::SmolStr;
use std::{fmt, ops::Index, time::Duration};
use testsync_metadata::{InternalTestItem, TestMessage, TestResultState};

/// The result of one test for one task.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TestTaskState {
    /// The state.
    pub state: TestResultState,

    /// How long the test took in this task.
    pub duration: Option<Duration>,

    /// Messages reported for the test in this task.
    pub messages: Vec<TestMessage>,
}

/// A test within a run's result.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestResultItem {
    /// The test as it was when added to the run.
    pub item: InternalTestItem,

    /// One entry per task in the run.
    pub tasks: Vec<TestTaskState>,

    /// The most severe state across tasks.
    pub own_state: TestResultState,

    /// The aggregated state of this test and its descendants in the run.
    pub computed_state: TestResultState,

    /// The longest duration reported for this test.
    pub own_duration: Option<Duration>,

    /// The longest duration of this test and its descendants in the run.
    pub duration: Option<Duration>,

    /// True if this result is stale.
    pub retired: bool,

    pub(super) children: Vec<SmolStr>,
}

impl TestResultItem {
    /// Returns the composite ID of the test.
    pub fn id(&self) -> &SmolStr {
        self.item.id()
    }

    /// Returns the IDs of the test's children that are part of the run.
    pub fn children(&self) -> &[SmolStr] {
        &self.children
    }
}

/// The number of tests in a run by own state.
///
/// Every test in a run is counted in exactly one state.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StateCounts {
    counts: [usize; TestResultState::ALL.len()],
}

impl StateCounts {
    /// Returns the number of tests in `state`.
    pub fn get(&self, state: TestResultState) -> usize {
        self.counts[state as usize]
    }

    /// Returns the total number of tests.
    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Iterates over non-zero counts.
    pub fn iter(&self) -> impl Iterator<Item = (TestResultState, usize)> + '_ {
        TestResultState::ALL
            .into_iter()
            .map(|state| (state, self.get(state)))
            .filter(|&(_, count)| count > 0)
    }

    pub(super) fn add(&mut self, state: TestResultState) {
        self.counts[state as usize] += 1;
    }

    pub(super) fn move_test(&mut self, from: TestResultState, to: TestResultState) {
        debug_assert!(self.counts[from as usize] > 0, "no tests counted as {from}");
        self.counts[from as usize] -= 1;
        self.counts[to as usize] += 1;
    }
}

impl Index<TestResultState> for StateCounts {
    type Output = usize;

    fn index(&self, state: TestResultState) -> &usize {
        &self.counts[state as usize]
    }
}

impl fmt::Display for StateCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (state, count) in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{count} {state}")?;
            first = false;
        }
        if first {
            f.write_str("no tests")?;
        }
        Ok(())
    }
}
