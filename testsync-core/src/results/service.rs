// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{LiveTestResult, TestResultItem};
use crate::{config::TestSyncConfig, helpers::lock};
use smol_str::SmolStr;
use std::sync::{Arc, Mutex};
use testsync_metadata::{ResolvedTestRunRequest, RunId, TestResultState};
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A change to the set of results held by a [`TestResultService`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResultChangeEvent {
    /// A run started.
    Started(RunId),

    /// A run completed.
    Completed(RunId),

    /// Finished runs were dropped, either by [`TestResultService::clear`] or
    /// to stay within the retention limit.
    Removed(Vec<RunId>),
}

/// Holds the results of recent runs, newest first.
///
/// This is a cheaply cloneable handle. Controllers can hold a clone to look up
/// the live result for a run ID they were asked to run.
#[derive(Clone, Debug)]
pub struct TestResultService {
    inner: Arc<ServiceInner>,
}

#[derive(Debug)]
struct ServiceInner {
    results: Mutex<Vec<LiveTestResult>>,
    max_retained: usize,
    events: broadcast::Sender<ResultChangeEvent>,
}

impl TestResultService {
    /// Creates a service that keeps at most `max_retained` finished results.
    pub fn new(max_retained: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ServiceInner {
                results: Mutex::new(Vec::new()),
                max_retained,
                events,
            }),
        }
    }

    /// Creates a service using the retention limit from `config`.
    pub fn from_config(config: &TestSyncConfig) -> Self {
        Self::new(config.max_retained_results())
    }

    /// Subscribes to changes to the set of results.
    pub fn subscribe(&self) -> broadcast::Receiver<ResultChangeEvent> {
        self.inner.events.subscribe()
    }

    /// Starts tracking a new run.
    pub fn create_live_result(&self, request: ResolvedTestRunRequest) -> LiveTestResult {
        let result = LiveTestResult::with_service_events(
            RunId::new_v4(),
            request,
            Some(self.inner.events.clone()),
        );

        let evicted = {
            let mut results = lock(&self.inner.results);
            results.insert(0, result.clone());
            self.evict(&mut results)
        };

        debug!(run_id = %result.id(), "run started");
        _ = self.inner.events.send(ResultChangeEvent::Started(result.id()));
        if !evicted.is_empty() {
            _ = self.inner.events.send(ResultChangeEvent::Removed(evicted));
        }
        result
    }

    // Drops the oldest finished results beyond the retention limit. Running
    // results are never dropped.
    fn evict(&self, results: &mut Vec<LiveTestResult>) -> Vec<RunId> {
        let mut finished = 0;
        let mut evicted = Vec::new();
        results.retain(|result| {
            if !result.is_complete() {
                return true;
            }
            finished += 1;
            if finished > self.inner.max_retained {
                evicted.push(result.id());
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Looks up a result by run ID.
    pub fn result(&self, run_id: RunId) -> Option<LiveTestResult> {
        lock(&self.inner.results)
            .iter()
            .find(|result| result.id() == run_id)
            .cloned()
    }

    /// Returns every result, newest first.
    pub fn results(&self) -> Vec<LiveTestResult> {
        lock(&self.inner.results).clone()
    }

    /// Returns the newest result that has a state for `test_id`, along with
    /// that state.
    pub fn state_by_id(&self, test_id: &str) -> Option<(LiveTestResult, TestResultItem)> {
        let results = lock(&self.inner.results).clone();
        results.into_iter().find_map(|result| {
            let item = result.get_state_by_id(test_id)?;
            (item.computed_state != TestResultState::Unset).then_some((result, item))
        })
    }

    /// Marks tests and their descendants as retired in every result.
    pub fn mark_retired(&self, test_ids: &[SmolStr]) {
        for result in self.results() {
            result.mark_retired(Some(test_ids));
        }
    }

    /// Drops every finished result. Running results are kept.
    pub fn clear(&self) {
        let removed: Vec<RunId> = {
            let mut results = lock(&self.inner.results);
            let (keep, removed): (Vec<_>, Vec<_>) =
                results.drain(..).partition(|result| !result.is_complete());
            *results = keep;
            removed.iter().map(LiveTestResult::id).collect()
        };
        _ = self.inner.events.send(ResultChangeEvent::Removed(removed));
    }
}
