// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    ResultChangeEvent,
    item::{StateCounts, TestResultItem, TestTaskState},
};
use crate::{
    computed_state::{ComputedStateAccessor, refresh_computed_state},
    errors::LiveResultError,
    helpers::lock,
    time::{StopwatchSnapshot, StopwatchStart, stopwatch},
};
use chrono::{DateTime, Local};
use indexmap::{IndexMap, IndexSet};
use smol_str::SmolStr;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use testsync_metadata::{
    InternalTestItem, Location, ResolvedTestRunRequest, RunId, TestId, TestItem,
    TestItemExpandState, TestMessage, TestResultState, TestRunTask, max_priority,
};
use tokio::sync::broadcast;
use tracing::debug;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;
const OUTPUT_PREVIEW_CHARS: usize = 100;

/// Why a [`TestResultItemChange`] was fired.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TestResultItemChangeReason {
    /// The test's own state or own duration changed.
    ///
    /// This is also fired by [`LiveTestResult::append_message`], with
    /// `previous_state` equal to the current state.
    OwnStateChange {
        /// The own state before the change.
        previous_state: TestResultState,

        /// The own duration before the change.
        previous_own_duration: Option<Duration>,
    },

    /// The aggregated state of the test's subtree changed.
    ComputedStateChange,

    /// The result for the test was marked stale.
    Retired,

    /// Output was attached to the test.
    NewMessage(TestMessage),
}

/// A change to one test in a live result.
#[derive(Clone, Debug)]
pub struct TestResultItemChange {
    /// The run the test belongs to.
    pub run_id: RunId,

    /// A snapshot of the test after the change.
    pub item: TestResultItem,

    /// Why the change was fired.
    pub reason: TestResultItemChangeReason,
}

/// A task within a live result, with its output.
#[derive(Clone, Debug)]
pub struct TestResultTask {
    /// The task as reported by the controller.
    pub task: TestRunTask,

    /// Raw output written to the task.
    pub output: String,

    /// Output messages not attached to any test.
    pub other_messages: Vec<TestMessage>,
}

/// The result of a test run that may still be in progress.
///
/// This is a cheaply cloneable handle: every clone refers to the same run.
/// Controllers report progress through it while the run orchestrator waits for
/// them.
#[derive(Clone, Debug)]
pub struct LiveTestResult {
    inner: Arc<LiveInner>,
}

#[derive(Debug)]
struct LiveInner {
    id: RunId,
    request: ResolvedTestRunRequest,
    started: StopwatchStart,
    state: Mutex<LiveState>,
    changes: broadcast::Sender<TestResultItemChange>,
    // Set by the result service.
    service_events: Option<broadcast::Sender<ResultChangeEvent>>,
}

#[derive(Debug, Default)]
struct LiveState {
    tests: IndexMap<SmolStr, TestResultItem>,
    tasks: Vec<TestResultTask>,
    counts: StateCounts,
    completed: Option<StopwatchSnapshot>,
}

impl LiveTestResult {
    /// Creates a new live result for a request.
    pub fn new(id: RunId, request: ResolvedTestRunRequest) -> Self {
        Self::with_service_events(id, request, None)
    }

    pub(super) fn with_service_events(
        id: RunId,
        request: ResolvedTestRunRequest,
        service_events: Option<broadcast::Sender<ResultChangeEvent>>,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(LiveInner {
                id,
                request,
                started: stopwatch(),
                state: Mutex::new(LiveState::default()),
                changes,
                service_events,
            }),
        }
    }

    /// Returns the run ID.
    pub fn id(&self) -> RunId {
        self.inner.id
    }

    /// Returns the request this result was created for.
    pub fn request(&self) -> &ResolvedTestRunRequest {
        &self.inner.request
    }

    /// Subscribes to changes to individual tests.
    pub fn subscribe(&self) -> broadcast::Receiver<TestResultItemChange> {
        self.inner.changes.subscribe()
    }

    /// Returns true if both handles refer to the same run.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns when the run started.
    pub fn started_at(&self) -> DateTime<Local> {
        self.inner.started.start_time()
    }

    /// Returns when the run completed, if it has.
    pub fn completed_at(&self) -> Option<DateTime<Local>> {
        lock(&self.inner.state)
            .completed
            .map(|snapshot| snapshot.end_time())
    }

    /// Returns how long the run took, or has taken so far.
    pub fn duration(&self) -> Duration {
        match lock(&self.inner.state).completed {
            Some(snapshot) => snapshot.duration,
            None => self.inner.started.snapshot().duration,
        }
    }

    /// Returns true if the run has completed.
    pub fn is_complete(&self) -> bool {
        lock(&self.inner.state).completed.is_some()
    }

    /// Returns the number of tests in each state.
    pub fn counts(&self) -> StateCounts {
        lock(&self.inner.state).counts
    }

    /// Returns a snapshot of a test.
    pub fn get_state_by_id(&self, test_id: &str) -> Option<TestResultItem> {
        lock(&self.inner.state).tests.get(test_id).cloned()
    }

    /// Returns a snapshot of every test, in the order they were added.
    pub fn tests(&self) -> Vec<TestResultItem> {
        lock(&self.inner.state).tests.values().cloned().collect()
    }

    /// Returns a snapshot of the tasks.
    pub fn tasks(&self) -> Vec<TestResultTask> {
        lock(&self.inner.state).tasks.clone()
    }

    /// Adds a task to the run, queueing every test already in the run for it.
    pub fn add_task(&self, task: TestRunTask) {
        let mut state = lock(&self.inner.state);
        state.tasks.push(TestResultTask {
            task,
            output: String::new(),
            other_messages: Vec::new(),
        });
        let index = state.tasks.len() - 1;

        let ids: Vec<SmolStr> = state.tests.keys().cloned().collect();
        for id in ids {
            if let Some(test) = state.tests.get_mut(&id) {
                test.tasks.push(TestTaskState::default());
            }
            self.fire_update_and_refresh(&mut state, &id, index, TestResultState::Queued, None);
        }
    }

    /// Adds a chain of tests, from a controller root down to a leaf, to the
    /// run. Tests already in the run are reused.
    ///
    /// The leaf is queued for every task in the run.
    pub fn add_test_chain_to_run(&self, controller_id: &str, chain: &[TestItem]) {
        let Some((first, rest)) = chain.split_first() else {
            return;
        };

        let mut state = lock(&self.inner.state);
        let mut parent = self.add_test_to_run(&mut state, controller_id, first, None);
        for item in rest {
            parent = self.add_test_to_run(&mut state, controller_id, item, Some(parent));
        }

        for index in 0..state.tasks.len() {
            self.fire_update_and_refresh(&mut state, &parent, index, TestResultState::Queued, None);
        }
    }

    fn add_test_to_run(
        &self,
        state: &mut LiveState,
        controller_id: &str,
        item: &TestItem,
        parent: Option<SmolStr>,
    ) -> SmolStr {
        let id = item.ext_id.clone();
        if state.tests.contains_key(&id) {
            return id;
        }

        if let Some(parent) = parent.as_ref().and_then(|p| state.tests.get_mut(p)) {
            parent.children.push(id.clone());
        }
        let node = TestResultItem {
            item: InternalTestItem {
                controller_id: controller_id.into(),
                expand: TestItemExpandState::NotExpandable,
                parent,
                item: item.clone(),
            },
            tasks: vec![TestTaskState::default(); state.tasks.len()],
            own_state: TestResultState::Unset,
            computed_state: TestResultState::Unset,
            own_duration: None,
            duration: None,
            retired: false,
            children: Vec::new(),
        };
        state.tests.insert(id.clone(), node);
        state.counts.add(TestResultState::Unset);
        id
    }

    /// Updates the state of a test for a task.
    ///
    /// Updates for tests not in the run are ignored. Once a test's state for a
    /// task is terminal, it may only move to a more severe terminal state.
    pub fn update_state(
        &self,
        test_id: &str,
        task_id: &str,
        new_state: TestResultState,
        duration: Option<Duration>,
    ) -> Result<(), LiveResultError> {
        let mut state = lock(&self.inner.state);
        let Some(test) = state.tests.get(test_id) else {
            return Ok(());
        };
        let index = task_index(&state, task_id)?;
        let id = test.item.id().clone();

        let current = test.tasks.get(index).map_or_else(TestResultState::default, |t| t.state);
        if let Some(current_priority) = current.terminal_priority() {
            match new_state.terminal_priority() {
                Some(new_priority) if new_priority >= current_priority => {}
                _ => {
                    debug!(
                        test_id = %id.escape_debug(),
                        task_id,
                        "ignoring transition from {current} to {new_state}",
                    );
                    return Ok(());
                }
            }
        }

        self.fire_update_and_refresh(&mut state, &id, index, new_state, duration);
        Ok(())
    }

    /// Appends a message to a test's result for a task.
    ///
    /// Messages for tests not in the run are ignored.
    pub fn append_message(
        &self,
        test_id: &str,
        task_id: &str,
        message: TestMessage,
    ) -> Result<(), LiveResultError> {
        let mut state = lock(&self.inner.state);
        if !state.tests.contains_key(test_id) {
            return Ok(());
        }
        let index = task_index(&state, task_id)?;
        let Some(test) = state.tests.get_mut(test_id) else {
            return Ok(());
        };
        if let Some(task) = test.tasks.get_mut(index) {
            task.messages.push(message);
        }

        let previous_state = test.own_state;
        let previous_own_duration = test.own_duration;
        let item = test.clone();
        self.send(
            item,
            TestResultItemChangeReason::OwnStateChange {
                previous_state,
                previous_own_duration,
            },
        );
        Ok(())
    }

    /// Appends raw output to a task.
    ///
    /// If `test_id` names a test in the run, an output message pointing at
    /// this chunk is attached to the test. Otherwise it is kept with the task.
    pub fn append_output(
        &self,
        task_id: &str,
        output: &str,
        location: Option<Location>,
        test_id: Option<&str>,
    ) -> Result<(), LiveResultError> {
        let mut guard = lock(&self.inner.state);
        let state = &mut *guard;
        let index = task_index(state, task_id)?;
        let task = &mut state.tasks[index];
        let offset = task.output.len() as u64;
        task.output.push_str(output);

        let message = TestMessage::Output {
            message: output_preview(output),
            offset,
            location,
        };

        match test_id.and_then(|id| state.tests.get_mut(id)) {
            Some(test) => {
                if let Some(task) = test.tasks.get_mut(index) {
                    task.messages.push(message.clone());
                }
                let item = test.clone();
                self.send(item, TestResultItemChangeReason::NewMessage(message));
            }
            None => state.tasks[index].other_messages.push(message),
        }
        Ok(())
    }

    /// Marks a task as finished. Tests still queued or running for it are
    /// reset to unset.
    pub fn mark_task_complete(&self, task_id: &str) -> Result<(), LiveResultError> {
        let mut state = lock(&self.inner.state);
        let index = task_index(&state, task_id)?;
        self.mark_task_complete_at(&mut state, index);
        Ok(())
    }

    fn mark_task_complete_at(&self, state: &mut LiveState, index: usize) {
        state.tasks[index].task.running = false;

        let unfinished: Vec<SmolStr> = state
            .tests
            .values()
            .filter(|test| {
                test.tasks.get(index).is_some_and(|t| {
                    matches!(t.state, TestResultState::Queued | TestResultState::Running)
                })
            })
            .map(|test| test.item.id().clone())
            .collect();
        for id in unfinished {
            self.fire_update_and_refresh(state, &id, index, TestResultState::Unset, None);
        }
    }

    /// Marks the run as complete, finishing every task still running.
    ///
    /// Returns an error if the run was already complete.
    pub fn mark_complete(&self) -> Result<(), LiveResultError> {
        let mut state = lock(&self.inner.state);
        if state.completed.is_some() {
            return Err(LiveResultError::AlreadyCompleted);
        }
        for index in 0..state.tasks.len() {
            if state.tasks[index].task.running {
                self.mark_task_complete_at(&mut state, index);
            }
        }
        state.completed = Some(self.inner.started.snapshot());
        drop(state);

        debug!(run_id = %self.inner.id, "run complete");
        if let Some(events) = &self.inner.service_events {
            _ = events.send(ResultChangeEvent::Completed(self.inner.id));
        }
        Ok(())
    }

    /// Marks tests and their descendants as retired, or every test if
    /// `test_ids` is `None`.
    pub fn mark_retired(&self, test_ids: Option<&[SmolStr]>) {
        let mut state = lock(&self.inner.state);
        let mut retired = Vec::new();
        for (id, test) in state.tests.iter_mut() {
            let matches = test_ids.is_none_or(|ids| {
                ids.iter()
                    .any(|prefix| prefix == id || TestId::is_child(prefix, id))
            });
            if !test.retired && matches {
                test.retired = true;
                retired.push(test.clone());
            }
        }
        drop(state);

        for item in retired {
            self.send(item, TestResultItemChangeReason::Retired);
        }
    }

    // Sets a test's state for a task, recomputes its own state, and
    // aggregates the change upwards.
    fn fire_update_and_refresh(
        &self,
        state: &mut LiveState,
        id: &SmolStr,
        index: usize,
        new_state: TestResultState,
        new_duration: Option<Duration>,
    ) {
        let Some(test) = state.tests.get_mut(id) else {
            return;
        };
        let previous_state = test.own_state;
        let previous_own_duration = test.own_duration;

        if let Some(task) = test.tasks.get_mut(index) {
            task.state = new_state;
            if new_duration.is_some() {
                task.duration = new_duration;
            }
        }
        if new_duration.is_some() {
            test.own_duration = test.own_duration.max(new_duration);
        }

        let new_own_state = max_priority(test.tasks.iter().map(|t| t.state));
        if new_own_state == previous_state {
            if test.own_duration == previous_own_duration {
                return;
            }
            // Only durations can move here, so counts stay as they are.
            let changed = refresh_computed_state(
                &mut ResultStates {
                    tests: &mut state.tests,
                },
                id,
                None,
            );
            if let Some(test) = state.tests.get(id) {
                self.send(
                    test.clone(),
                    TestResultItemChangeReason::OwnStateChange {
                        previous_state,
                        previous_own_duration,
                    },
                );
            }
            self.send_computed_changes(state, id, &changed);
            return;
        }

        test.own_state = new_own_state;
        state.counts.move_test(previous_state, new_own_state);

        let changed = refresh_computed_state(
            &mut ResultStates {
                tests: &mut state.tests,
            },
            id,
            None,
        );

        if let Some(test) = state.tests.get(id) {
            self.send(
                test.clone(),
                TestResultItemChangeReason::OwnStateChange {
                    previous_state,
                    previous_own_duration,
                },
            );
        }
        self.send_computed_changes(state, id, &changed);
    }

    // Fires `ComputedStateChange` for every changed test other than `id`,
    // which has already had its own event.
    fn send_computed_changes(
        &self,
        state: &LiveState,
        id: &SmolStr,
        changed: &IndexSet<SmolStr>,
    ) {
        for changed_id in changed.iter().filter(|changed_id| *changed_id != id) {
            if let Some(test) = state.tests.get(changed_id) {
                self.send(test.clone(), TestResultItemChangeReason::ComputedStateChange);
            }
        }
    }

    fn send(&self, item: TestResultItem, reason: TestResultItemChangeReason) {
        // No receivers is fine.
        _ = self.inner.changes.send(TestResultItemChange {
            run_id: self.inner.id,
            item,
            reason,
        });
    }
}

fn task_index(state: &LiveState, task_id: &str) -> Result<usize, LiveResultError> {
    state
        .tasks
        .iter()
        .position(|t| t.task.id == task_id)
        .ok_or_else(|| LiveResultError::UnknownTask {
            task_id: task_id.into(),
        })
}

fn output_preview(output: &str) -> String {
    let mut chars = output.char_indices();
    match chars.nth(OUTPUT_PREVIEW_CHARS) {
        Some((end, _)) => format!("{}…", &output[..end]),
        None => output.to_owned(),
    }
}

struct ResultStates<'a> {
    tests: &'a mut IndexMap<SmolStr, TestResultItem>,
}

impl ComputedStateAccessor for ResultStates<'_> {
    type Node = SmolStr;

    fn own_state(&self, node: &SmolStr) -> TestResultState {
        self.tests
            .get(node)
            .map_or_else(TestResultState::default, |t| t.own_state)
    }

    fn computed_state(&self, node: &SmolStr) -> TestResultState {
        self.tests
            .get(node)
            .map_or_else(TestResultState::default, |t| t.computed_state)
    }

    fn set_computed_state(&mut self, node: &SmolStr, state: TestResultState) {
        if let Some(t) = self.tests.get_mut(node) {
            t.computed_state = state;
        }
    }

    fn own_duration(&self, node: &SmolStr) -> Option<Duration> {
        self.tests.get(node)?.own_duration
    }

    fn computed_duration(&self, node: &SmolStr) -> Option<Duration> {
        self.tests.get(node)?.duration
    }

    fn set_computed_duration(&mut self, node: &SmolStr, duration: Option<Duration>) {
        if let Some(t) = self.tests.get_mut(node) {
            t.duration = duration;
        }
    }

    fn children(&self, node: &SmolStr) -> Vec<SmolStr> {
        self.tests
            .get(node)
            .map(|t| t.children.clone())
            .unwrap_or_default()
    }

    fn parent(&self, node: &SmolStr) -> Option<SmolStr> {
        self.tests.get(node)?.item.parent.clone()
    }
}
