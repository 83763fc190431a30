// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The run orchestrator.
//!
//! [`TestService`] ties everything together: controllers register with it and
//! publish their tests into its [`TestCollection`], run requests are resolved
//! against its [`TestProfileRegistry`], and each run gets a
//! [`LiveTestResult`] from its [`TestResultService`].

use crate::{
    collection::{CollectionChangeSet, TestCollection},
    config::TestSyncConfig,
    controller::TestController,
    errors::{ControllerError, ExpandTestError, ProfileConfigureError},
    helpers::{lock, plural},
    profiles::{TestProfileRegistry, can_use_profile_with_test},
    results::{LiveTestResult, TestResultService},
};
use debug_ignore::DebugIgnore;
use futures::future;
use indexmap::{IndexMap, IndexSet};
use itertools::Itertools;
use smol_str::SmolStr;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use testsync_metadata::{
    InternalTestItem, ProfileGroup, ResolvedRunTarget, ResolvedTestRunRequest, RunId,
    RunTestForControllerRequest, TestId, TestRunProfile, TestRunProfileUpdate, TestsDiff,
    TestsDiffOp,
};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DIFF_CHANNEL_CAPACITY: usize = 256;

/// A request to run tests in a group, before profiles have been chosen.
#[derive(Clone, Debug, Default)]
pub struct AmbiguousRunRequest {
    /// The group to run in. If `None`, the configured default group is used.
    pub group: Option<ProfileGroup>,

    /// The tests to run.
    pub tests: Vec<InternalTestItem>,

    /// Tests to exclude.
    pub exclude: Option<Vec<InternalTestItem>>,

    /// True if the run was triggered automatically.
    pub is_auto_run: bool,
}

impl AmbiguousRunRequest {
    /// Creates a request for `tests` in the default group.
    pub fn new(tests: Vec<InternalTestItem>) -> Self {
        Self {
            tests,
            ..Default::default()
        }
    }

    /// Sets the group to run in.
    pub fn with_group(mut self, group: ProfileGroup) -> Self {
        self.group = Some(group);
        self
    }

    /// Sets the tests to exclude.
    pub fn with_exclude(mut self, exclude: Vec<InternalTestItem>) -> Self {
        self.exclude = Some(exclude);
        self
    }
}

/// A diff that was applied to the test tree.
#[derive(Clone, Debug)]
pub struct TestsDiffEvent {
    /// The controller that published the diff.
    pub controller_id: SmolStr,

    /// The diff as published.
    pub diff: TestsDiff,

    /// What the diff changed.
    pub changes: CollectionChangeSet,
}

/// Coordinates controllers, the test tree, run profiles and results.
///
/// This is a cheaply cloneable handle.
#[derive(Clone, Debug)]
pub struct TestService {
    inner: Arc<ServiceInner>,
}

#[derive(Debug)]
struct ServiceInner {
    collection: Mutex<TestCollection>,
    profiles: Mutex<TestProfileRegistry>,
    controllers: DebugIgnore<Mutex<IndexMap<SmolStr, Arc<dyn TestController>>>>,
    results: TestResultService,
    active_runs: Mutex<HashMap<RunId, CancellationToken>>,
    default_group: ProfileGroup,
    diffs: broadcast::Sender<TestsDiffEvent>,
    controller_count: watch::Sender<usize>,
}

impl TestService {
    /// Creates a service with no controllers.
    pub fn new(config: &TestSyncConfig) -> Self {
        let (diffs, _) = broadcast::channel(DIFF_CHANNEL_CAPACITY);
        let (controller_count, _) = watch::channel(0);
        Self {
            inner: Arc::new(ServiceInner {
                collection: Mutex::new(
                    TestCollection::new().with_warn_orphaned_adds(config.warn_orphaned_adds()),
                ),
                profiles: Mutex::new(TestProfileRegistry::new()),
                controllers: DebugIgnore(Mutex::new(IndexMap::new())),
                results: TestResultService::from_config(config),
                active_runs: Mutex::new(HashMap::new()),
                default_group: config.default_group().profile_group(),
                diffs,
                controller_count,
            }),
        }
    }

    /// Returns the result service that holds this service's runs.
    pub fn results(&self) -> &TestResultService {
        &self.inner.results
    }

    /// Calls `f` with the test tree.
    ///
    /// `f` must not call back into this service.
    pub fn with_collection<R>(&self, f: impl FnOnce(&TestCollection) -> R) -> R {
        f(&lock(&self.inner.collection))
    }

    /// Calls `f` with the profile registry.
    ///
    /// `f` must not call back into this service.
    pub fn with_profiles<R>(&self, f: impl FnOnce(&TestProfileRegistry) -> R) -> R {
        f(&lock(&self.inner.profiles))
    }

    /// Subscribes to diffs applied to the test tree.
    pub fn subscribe_diffs(&self) -> broadcast::Receiver<TestsDiffEvent> {
        self.inner.diffs.subscribe()
    }

    /// Watches the number of registered controllers.
    pub fn subscribe_controller_count(&self) -> watch::Receiver<usize> {
        self.inner.controller_count.subscribe()
    }

    /// Returns the number of registered controllers.
    pub fn controller_count(&self) -> usize {
        *self.inner.controller_count.borrow()
    }

    /// Returns the group used when a run request doesn't name one.
    pub fn default_group(&self) -> ProfileGroup {
        self.inner.default_group
    }

    /// Registers a controller under its ID.
    ///
    /// A controller registered earlier under the same ID is replaced.
    /// Dropping the returned registration unregisters the controller and
    /// removes its tests and profiles.
    pub fn register_test_controller(
        &self,
        controller: Arc<dyn TestController>,
    ) -> ControllerRegistration {
        let controller_id = SmolStr::new(controller.id());
        let count = {
            let mut controllers = lock(&self.inner.controllers.0);
            if controllers
                .insert(controller_id.clone(), controller.clone())
                .is_some()
            {
                warn!(
                    controller_id = %controller_id,
                    "controller registered twice, replacing the earlier registration",
                );
            }
            controllers.len()
        };
        self.inner.controller_count.send_replace(count);
        debug!(controller_id = %controller_id, label = controller.label(), "registered controller");

        ControllerRegistration {
            service: self.clone(),
            controller_id,
            controller: DebugIgnore(controller),
        }
    }

    fn unregister_test_controller(
        &self,
        controller_id: &SmolStr,
        controller: &Arc<dyn TestController>,
    ) {
        let count = {
            let mut controllers = lock(&self.inner.controllers.0);
            if !controllers
                .get(controller_id)
                .is_some_and(|current| Arc::ptr_eq(current, controller))
            {
                debug!(
                    controller_id = %controller_id,
                    "registration was superseded, leaving the newer controller in place",
                );
                return;
            }
            controllers.shift_remove(controller_id);
            controllers.len()
        };

        let diff: TestsDiff = lock(&self.inner.collection)
            .root_ids_for_controller(controller_id)
            .into_iter()
            .map(TestsDiffOp::Remove)
            .collect();
        self.publish_diff(controller_id, diff);
        lock(&self.inner.profiles).remove_profile(controller_id, None);

        self.inner.controller_count.send_replace(count);
        debug!(controller_id = %controller_id, "unregistered controller");
    }

    /// Returns the controller registered under `controller_id`.
    pub fn controller(&self, controller_id: &str) -> Option<Arc<dyn TestController>> {
        lock(&self.inner.controllers.0).get(controller_id).cloned()
    }

    /// Applies a diff from a controller to the test tree, then notifies
    /// subscribers.
    ///
    /// `Retire` ops also retire the test in every result that holds it.
    pub fn publish_diff(&self, controller_id: &str, diff: TestsDiff) -> CollectionChangeSet {
        let changes = {
            let mut collection = lock(&self.inner.collection);
            let changes = collection.apply(diff.iter().cloned());
            // Sent with the tree locked, so subscribers see diffs in the order
            // they were applied.
            _ = self.inner.diffs.send(TestsDiffEvent {
                controller_id: controller_id.into(),
                diff,
                changes: changes.clone(),
            });
            changes
        };

        if !changes.retired.is_empty() {
            self.inner.results.mark_retired(&changes.retired);
        }
        changes
    }

    /// Adds a run profile. A profile with the same ID is replaced.
    pub fn add_profile(&self, profile: TestRunProfile) {
        lock(&self.inner.profiles).add_profile(profile);
    }

    /// Updates a run profile. Returns false if the profile is unknown.
    pub fn update_profile(
        &self,
        controller_id: &str,
        profile_id: u32,
        update: &TestRunProfileUpdate,
    ) -> bool {
        lock(&self.inner.profiles).update_profile(controller_id, profile_id, update)
    }

    /// Removes one profile, or all of a controller's profiles.
    pub fn remove_profile(&self, controller_id: &str, profile_id: Option<u32>) {
        lock(&self.inner.profiles).remove_profile(controller_id, profile_id);
    }

    /// Asks the owning controller to open a profile's configuration.
    pub fn configure_profile(
        &self,
        controller_id: &str,
        profile_id: u32,
    ) -> Result<(), ProfileConfigureError> {
        let controller = self.controller(controller_id).ok_or_else(|| {
            ProfileConfigureError::UnknownController {
                controller_id: controller_id.into(),
            }
        })?;
        let configurable = lock(&self.inner.profiles)
            .get_profile(controller_id, profile_id)
            .map(|profile| profile.has_configuration_handler)
            .ok_or_else(|| ProfileConfigureError::UnknownProfile {
                controller_id: controller_id.into(),
                profile_id,
            })?;
        if !configurable {
            return Err(ProfileConfigureError::NotConfigurable {
                controller_id: controller_id.into(),
                profile_id,
            });
        }

        controller.configure_run_profile(profile_id);
        Ok(())
    }

    /// Chooses a profile for each test in `request`.
    ///
    /// Each controller's default profile for the group takes the tests it can
    /// run. If no default profile can run any of the tests, each test falls
    /// back to the first profile of its controller in the group that can run
    /// it. Tests no profile can run are left out.
    pub fn resolve_run_request(&self, request: &AmbiguousRunRequest) -> ResolvedTestRunRequest {
        let group = request.group.unwrap_or(self.inner.default_group);
        let profiles = lock(&self.inner.profiles);

        let mut targets: Vec<ResolvedRunTarget> = profiles
            .get_base_defaults_profile(group)
            .into_iter()
            .filter_map(|profile| {
                let test_ids: Vec<_> = request
                    .tests
                    .iter()
                    .filter(|test| can_use_profile_with_test(profile, test))
                    .map(|test| test.id().clone())
                    .collect();
                (!test_ids.is_empty()).then(|| ResolvedRunTarget {
                    controller_id: profile.controller_id.clone(),
                    profile_id: profile.profile_id,
                    profile_group: group,
                    test_ids,
                })
            })
            .collect();

        if targets.is_empty() {
            let mut by_controller: IndexMap<&SmolStr, IndexMap<u32, Vec<SmolStr>>> =
                IndexMap::new();
            for test in &request.tests {
                let Some(profile) = profiles
                    .get_controller_group_profiles(&test.controller_id, group)
                    .find(|profile| can_use_profile_with_test(profile, test))
                else {
                    debug!(test_id = ?test.id(), "no profile can run test, skipping");
                    continue;
                };
                by_controller
                    .entry(&test.controller_id)
                    .or_default()
                    .entry(profile.profile_id)
                    .or_default()
                    .push(test.id().clone());
            }

            for (controller_id, by_profile) in by_controller {
                targets.extend(by_profile.into_iter().map(|(profile_id, test_ids)| {
                    ResolvedRunTarget {
                        controller_id: controller_id.clone(),
                        profile_id,
                        profile_group: group,
                        test_ids,
                    }
                }));
            }
        }

        ResolvedTestRunRequest {
            targets,
            exclude: request
                .exclude
                .as_ref()
                .map(|tests| tests.iter().map(|test| test.id().clone()).collect()),
            is_auto_run: request.is_auto_run,
        }
    }

    /// Resolves profiles for `request`, then runs it.
    pub async fn run_tests(
        &self,
        request: AmbiguousRunRequest,
        token: Option<CancellationToken>,
    ) -> LiveTestResult {
        let resolved = self.resolve_run_request(&request);
        self.run_resolved_tests(resolved, token).await
    }

    /// Runs a resolved request, dispatching to every target's controller
    /// concurrently.
    ///
    /// The run is cancelled when `token` is cancelled, or through
    /// [`cancel_test_run`](Self::cancel_test_run). A controller that fails
    /// doesn't affect the others. The returned result is always complete.
    pub async fn run_resolved_tests(
        &self,
        mut request: ResolvedTestRunRequest,
        token: Option<CancellationToken>,
    ) -> LiveTestResult {
        let exclude = request.exclude.get_or_insert_with(Vec::new).clone();
        let targets = request.targets.clone();
        let result = self.inner.results.create_live_result(request);
        let run_id = result.id();

        let token = token.map_or_else(CancellationToken::new, |parent| parent.child_token());
        lock(&self.inner.active_runs).insert(run_id, token.clone());

        let test_count: usize = targets.iter().map(|target| target.test_ids.len()).sum();
        let controller_ids = targets
            .iter()
            .map(|target| &target.controller_id)
            .unique()
            .join(", ");
        let calls: Vec<_> = targets
            .into_iter()
            .filter_map(|target| {
                let Some(controller) = self.controller(&target.controller_id) else {
                    warn!(
                        run_id = %run_id,
                        controller_id = %target.controller_id,
                        "no controller is registered for run target, skipping",
                    );
                    return None;
                };
                let exclude_ext_ids = exclude
                    .iter()
                    .filter(|id| !target.test_ids.contains(id))
                    .cloned()
                    .collect();
                let controller_id = target.controller_id.clone();
                let call = controller.run_tests(
                    RunTestForControllerRequest {
                        run_id,
                        controller_id: target.controller_id,
                        profile_id: target.profile_id,
                        exclude_ext_ids,
                        test_ids: target.test_ids,
                    },
                    token.clone(),
                );
                Some(async move {
                    match call.await {
                        Ok(()) => {}
                        Err(ControllerError::Cancelled) => {
                            debug!(run_id = %run_id, controller_id = %controller_id, "controller run cancelled");
                        }
                        Err(error) => {
                            warn!(
                                run_id = %run_id,
                                controller_id = %controller_id,
                                "controller failed to run tests: {error}",
                            );
                        }
                    }
                })
            })
            .collect();

        debug!(
            run_id = %run_id,
            "dispatching {test_count} {} to {} {} ({controller_ids})",
            plural::tests_str(test_count),
            calls.len(),
            plural::controllers_str(calls.len()),
        );
        tokio::select! {
            biased;
            _ = future::join_all(calls) => {}
            () = token.cancelled() => {
                debug!(run_id = %run_id, "run cancelled, no longer waiting on controllers");
            }
        }

        lock(&self.inner.active_runs).remove(&run_id);
        if let Err(error) = result.mark_complete() {
            debug!(run_id = %run_id, "{error}");
        }
        self.sync_result_states(&result);
        debug!(run_id = %run_id, counts = %result.counts(), "run finished");
        result
    }

    /// Cancels one active run, or every active run if `run_id` is `None`.
    pub fn cancel_test_run(&self, run_id: Option<RunId>) {
        let runs = lock(&self.inner.active_runs);
        match run_id {
            Some(run_id) => {
                if let Some(token) = runs.get(&run_id) {
                    token.cancel();
                }
            }
            None => runs.values().for_each(CancellationToken::cancel),
        }
    }

    /// Returns the IDs of runs that are still in progress.
    pub fn active_runs(&self) -> Vec<RunId> {
        lock(&self.inner.active_runs).keys().copied().collect()
    }

    /// Copies the states of a run's tests into the test tree.
    ///
    /// Returns the IDs whose tree state changed.
    pub fn sync_result_states(&self, result: &LiveTestResult) -> IndexSet<SmolStr> {
        let tests = result.tests();
        let mut collection = lock(&self.inner.collection);
        let mut changed = IndexSet::new();
        for test in &tests {
            changed.extend(collection.apply_result_state(
                test.id(),
                test.own_state,
                test.own_duration,
                test.retired,
                None,
            ));
        }
        changed
    }

    /// Asks the controller that owns `test_id` to expand it.
    ///
    /// Unlike [`expand`](Self::expand), every call reaches the controller.
    pub async fn expand_test(&self, test_id: &str, levels: u32) -> Result<(), ExpandTestError> {
        let (controller_id, controller) = self.controller_for_test(test_id)?;
        controller
            .expand_test(test_id, levels)
            .await
            .map_err(|error| ExpandTestError::Controller {
                controller_id,
                error,
            })
    }

    /// Expands a test in the tree `levels` deep.
    ///
    /// Concurrent calls for the same test share a single request to the
    /// controller, as long as the first request covers `levels`. Tests that
    /// aren't in the tree are ignored.
    pub async fn expand(&self, test_id: &str, levels: u32) -> Result<(), ExpandTestError> {
        let (controller_id, controller) = self.controller_for_test(test_id)?;
        let expansion = lock(&self.inner.collection).expand(test_id, levels, |id, levels| {
            controller.expand_test(id, levels)
        });
        let Some(expansion) = expansion else {
            return Ok(());
        };
        expansion
            .await
            .map_err(|error| ExpandTestError::Controller {
                controller_id,
                error,
            })
    }

    fn controller_for_test(
        &self,
        test_id: &str,
    ) -> Result<(SmolStr, Arc<dyn TestController>), ExpandTestError> {
        let controller_id = SmolStr::new(TestId::controller_id_of(test_id));
        match self.controller(&controller_id) {
            Some(controller) => Ok((controller_id, controller)),
            None => Err(ExpandTestError::UnknownController {
                controller_id,
                test_id: test_id.into(),
            }),
        }
    }
}

/// A controller's registration with a [`TestService`].
///
/// Dropping this unregisters the controller: its root tests are removed from
/// the tree through a published diff, its profiles are removed, and the
/// controller count is updated.
#[derive(Debug)]
#[must_use = "dropping a registration unregisters the controller"]
pub struct ControllerRegistration {
    service: TestService,
    controller_id: SmolStr,
    controller: DebugIgnore<Arc<dyn TestController>>,
}

impl ControllerRegistration {
    /// Returns the ID of the registered controller.
    pub fn controller_id(&self) -> &SmolStr {
        &self.controller_id
    }

    /// Unregisters the controller.
    pub fn dispose(self) {
        drop(self);
    }
}

impl Drop for ControllerRegistration {
    fn drop(&mut self) {
        self.service
            .unregister_test_controller(&self.controller_id, &self.controller.0);
    }
}
