// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use futures::{
    FutureExt,
    future::{self, BoxFuture},
};
use smol_str::SmolStr;
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use testsync_core::{
    config::TestSyncConfig,
    controller::TestController,
    errors::ControllerError,
    service::{ControllerRegistration, TestService},
};
use testsync_metadata::{
    InternalTestItem, ProfileGroup, RunTestForControllerRequest, TestId, TestItem,
    TestItemExpandState, TestResultState, TestRunProfile, TestRunTask, TestsDiffOp,
};
use tokio_util::sync::CancellationToken;

pub(crate) fn test_init() {
    // Ignore the error if a subscriber is already installed.
    _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub(crate) fn service() -> TestService {
    test_init();
    TestService::new(&TestSyncConfig::default_config("."))
}

/// What a [`FakeController`] does when asked to run tests.
#[derive(Clone, Copy, Debug)]
pub(crate) enum RunBehavior {
    /// Reports every requested test with this state.
    Report(TestResultState),

    /// Returns an error without reporting anything.
    Fail,

    /// Waits for the token to be cancelled.
    WaitForCancel,

    /// Never returns, ignoring cancellation.
    Hang,
}

/// An in-process controller that publishes into a [`TestService`].
pub(crate) struct FakeController {
    id: SmolStr,
    service: TestService,
    behavior: RunBehavior,
    run_requests: Mutex<Vec<RunTestForControllerRequest>>,
    expand_calls: AtomicUsize,
}

impl FakeController {
    pub(crate) fn new(service: &TestService, id: &str, behavior: RunBehavior) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            service: service.clone(),
            behavior,
            run_requests: Mutex::new(Vec::new()),
            expand_calls: AtomicUsize::new(0),
        })
    }

    /// Registers the controller along with a default run profile, and
    /// publishes its root plus `children` below it.
    pub(crate) fn register(self: &Arc<Self>, children: &[&str]) -> ControllerRegistration {
        let registration = self.service.register_test_controller(self.clone());
        self.service.add_profile(TestRunProfile {
            controller_id: self.id.clone(),
            profile_id: 1,
            label: "Run".to_owned(),
            group: ProfileGroup::RUN,
            is_default: true,
            tag: None,
            has_configuration_handler: false,
        });

        let root = TestId::root(&self.id).unwrap();
        let mut diff = vec![TestsDiffOp::Add(internal_item(&root, TestItemExpandState::Expandable))];
        diff.extend(children.iter().map(|child| {
            TestsDiffOp::Add(internal_item(
                &root.join(child).unwrap(),
                TestItemExpandState::Expandable,
            ))
        }));
        self.service.publish_diff(&self.id, diff);
        registration
    }

    pub(crate) fn run_requests(&self) -> Vec<RunTestForControllerRequest> {
        self.run_requests.lock().unwrap().clone()
    }

    pub(crate) fn expand_calls(&self) -> usize {
        self.expand_calls.load(Ordering::SeqCst)
    }
}

impl TestController for FakeController {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        "fake"
    }

    fn configure_run_profile(&self, _profile_id: u32) {}

    fn expand_test(
        &self,
        test_id: &str,
        levels: u32,
    ) -> BoxFuture<'static, Result<(), ControllerError>> {
        self.expand_calls.fetch_add(1, Ordering::SeqCst);
        let service = self.service.clone();
        let controller_id = self.id.clone();
        let parent = TestId::from_string(test_id).unwrap();
        async move {
            tokio::task::yield_now().await;
            // Each expanded test gets a single child per level.
            let mut diff = Vec::new();
            let mut current = parent;
            for _ in 0..levels {
                current = current.join("child").unwrap();
                diff.push(TestsDiffOp::Add(internal_item(
                    &current,
                    TestItemExpandState::NotExpandable,
                )));
            }
            service.publish_diff(&controller_id, diff);
            Ok(())
        }
        .boxed()
    }

    fn run_tests(
        &self,
        request: RunTestForControllerRequest,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<(), ControllerError>> {
        self.run_requests.lock().unwrap().push(request.clone());
        match self.behavior {
            RunBehavior::Report(state) => {
                let service = self.service.clone();
                let controller_id = self.id.clone();
                async move {
                    report(&service, &controller_id, &request, state);
                    Ok(())
                }
                .boxed()
            }
            RunBehavior::Fail => future::ready(Err(ControllerError::failed("boom"))).boxed(),
            RunBehavior::WaitForCancel => async move {
                token.cancelled().await;
                Err(ControllerError::Cancelled)
            }
            .boxed(),
            RunBehavior::Hang => future::pending().boxed(),
        }
    }
}

fn report(
    service: &TestService,
    controller_id: &str,
    request: &RunTestForControllerRequest,
    state: TestResultState,
) {
    let result = service.results().result(request.run_id).unwrap();
    let task_id = format!("{controller_id}-task");
    result.add_task(TestRunTask::new(task_id.as_str()));

    for test_id in &request.test_ids {
        let chain: Vec<TestItem> = service.with_collection(|collection| {
            TestId::from_string(test_id)
                .unwrap()
                .ids_from_root()
                .map(|id| {
                    collection
                        .get_node_by_id(&id.to_string())
                        .unwrap()
                        .item()
                        .item
                        .clone()
                })
                .collect()
        });
        result.add_test_chain_to_run(controller_id, &chain);
        result
            .update_state(test_id, &task_id, TestResultState::Running, None)
            .unwrap();
        result
            .update_state(test_id, &task_id, state, Some(Duration::from_millis(5)))
            .unwrap();
    }
    result.mark_task_complete(&task_id).unwrap();
}

pub(crate) fn internal_item(id: &TestId, expand: TestItemExpandState) -> InternalTestItem {
    InternalTestItem {
        controller_id: id.controller_id().into(),
        expand,
        parent: id.parent_id().map(|parent| SmolStr::from(&parent)),
        item: TestItem::new(id, id.local_id()),
    }
}

/// Looks up tests in the service's tree.
pub(crate) fn tree_items(service: &TestService, ids: &[&str]) -> Vec<InternalTestItem> {
    service.with_collection(|collection| {
        ids.iter()
            .map(|id| collection.get_node_by_id(id).unwrap().item().clone())
            .collect()
    })
}
