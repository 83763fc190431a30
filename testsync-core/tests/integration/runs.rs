// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use maplit::hashmap;
use pretty_assertions::assert_eq;
use smol_str::SmolStr;
use std::collections::HashMap;
use testsync_core::{
    results::ResultChangeEvent,
    service::{AmbiguousRunRequest, TestService},
};
use testsync_metadata::{ResolvedRunTarget, ResolvedTestRunRequest, TestResultState};
use tokio_util::sync::CancellationToken;

async fn wait_for_active_run(service: &TestService) {
    while service.active_runs().is_empty() {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn run_reports_states() {
    let service = service();
    let controller = FakeController::new(&service, "a", RunBehavior::Report(TestResultState::Failed));
    let _registration = controller.register(&["x", "y"]);
    let mut events = service.results().subscribe();

    let tests = tree_items(&service, &["a\0x", "a\0y"]);
    let result = service.run_tests(AmbiguousRunRequest::new(tests), None).await;

    assert!(result.is_complete());
    assert!(result.completed_at().is_some());
    // The root has no own state.
    assert_eq!(
        result.counts().iter().collect::<HashMap<_, _>>(),
        hashmap! {
            TestResultState::Failed => 2,
            TestResultState::Unset => 1,
        }
    );
    assert_eq!(
        result.get_state_by_id("a").unwrap().computed_state,
        TestResultState::Failed
    );

    let requests = controller.run_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].run_id, result.id());
    assert_eq!(requests[0].profile_id, 1);
    assert_eq!(requests[0].test_ids, vec![SmolStr::new("a\0x"), SmolStr::new("a\0y")]);

    // Final states are copied into the tree.
    service.with_collection(|collection| {
        let root = collection.get_node_by_id("a").unwrap();
        assert_eq!(root.state().computed_state, TestResultState::Failed);
        let leaf = collection.get_node_by_id("a\0x").unwrap();
        assert_eq!(leaf.state().own_state, TestResultState::Failed);
    });

    assert_eq!(events.try_recv().unwrap(), ResultChangeEvent::Started(result.id()));
    assert_eq!(events.try_recv().unwrap(), ResultChangeEvent::Completed(result.id()));
    assert!(service.active_runs().is_empty());
}

#[tokio::test]
async fn failing_controller_does_not_abort_siblings() {
    let service = service();
    let failing = FakeController::new(&service, "a", RunBehavior::Fail);
    let passing = FakeController::new(&service, "b", RunBehavior::Report(TestResultState::Passed));
    let _a = failing.register(&["x"]);
    let _b = passing.register(&["y"]);

    let tests = tree_items(&service, &["a\0x", "b\0y"]);
    let result = service.run_tests(AmbiguousRunRequest::new(tests), None).await;

    assert!(result.is_complete());
    assert_eq!(failing.run_requests().len(), 1);
    assert_eq!(
        result.get_state_by_id("b\0y").unwrap().own_state,
        TestResultState::Passed
    );
    assert!(result.get_state_by_id("a\0x").is_none());
}

#[tokio::test]
async fn exclusions_are_forwarded_per_target() {
    let service = service();
    let a = FakeController::new(&service, "a", RunBehavior::Report(TestResultState::Passed));
    let b = FakeController::new(&service, "b", RunBehavior::Report(TestResultState::Passed));
    let _a = a.register(&["x", "skip"]);
    let _b = b.register(&["y"]);

    let request = ResolvedTestRunRequest {
        targets: vec![
            ResolvedRunTarget {
                controller_id: "a".into(),
                profile_id: 1,
                profile_group: service.default_group(),
                test_ids: vec!["a\0x".into()],
            },
            ResolvedRunTarget {
                controller_id: "b".into(),
                profile_id: 1,
                profile_group: service.default_group(),
                test_ids: vec!["b\0y".into()],
            },
        ],
        exclude: Some(vec!["a\0skip".into(), "b\0y".into()]),
        is_auto_run: true,
    };
    let result = service.run_resolved_tests(request, None).await;

    assert_eq!(
        a.run_requests()[0].exclude_ext_ids,
        vec![SmolStr::new("a\0skip"), SmolStr::new("b\0y")]
    );
    // A target's own tests are never excluded from it.
    assert_eq!(b.run_requests()[0].exclude_ext_ids, vec![SmolStr::new("a\0skip")]);
    assert!(result.request().is_auto_run);
}

#[tokio::test]
async fn missing_exclude_defaults_to_empty() {
    let service = service();
    let a = FakeController::new(&service, "a", RunBehavior::Report(TestResultState::Passed));
    let _a = a.register(&["x"]);

    let tests = tree_items(&service, &["a\0x"]);
    let result = service.run_tests(AmbiguousRunRequest::new(tests), None).await;

    assert!(a.run_requests()[0].exclude_ext_ids.is_empty());
    assert_eq!(result.request().exclude, Some(Vec::new()));
}

#[tokio::test]
async fn unregistered_target_is_skipped() {
    let service = service();
    let request = ResolvedTestRunRequest {
        targets: vec![ResolvedRunTarget {
            controller_id: "gone".into(),
            profile_id: 1,
            profile_group: service.default_group(),
            test_ids: vec!["gone\0x".into()],
        }],
        ..Default::default()
    };
    let result = service.run_resolved_tests(request, None).await;
    assert!(result.is_complete());
    assert_eq!(result.counts().total(), 0);
}

#[tokio::test]
async fn cancel_test_run_stops_cooperating_controllers() {
    let service = service();
    let controller = FakeController::new(&service, "a", RunBehavior::WaitForCancel);
    let _registration = controller.register(&["x"]);

    let tests = tree_items(&service, &["a\0x"]);
    let run = tokio::spawn({
        let service = service.clone();
        async move { service.run_tests(AmbiguousRunRequest::new(tests), None).await }
    });

    wait_for_active_run(&service).await;
    let run_id = service.active_runs()[0];
    service.cancel_test_run(Some(run_id));

    let result = run.await.unwrap();
    assert_eq!(result.id(), run_id);
    assert!(result.is_complete());
    assert!(service.active_runs().is_empty());
}

#[tokio::test]
async fn parent_token_stops_waiting_on_hung_controllers() {
    let service = service();
    let hung = FakeController::new(&service, "a", RunBehavior::Hang);
    let _registration = hung.register(&["x"]);

    let token = CancellationToken::new();
    let tests = tree_items(&service, &["a\0x"]);
    let run = tokio::spawn({
        let service = service.clone();
        let token = token.clone();
        async move {
            service
                .run_tests(AmbiguousRunRequest::new(tests), Some(token))
                .await
        }
    });

    wait_for_active_run(&service).await;
    token.cancel();

    let result = run.await.unwrap();
    assert!(result.is_complete());
}

#[tokio::test]
async fn cancel_all_runs() {
    let service = service();
    let controller = FakeController::new(&service, "a", RunBehavior::WaitForCancel);
    let _registration = controller.register(&["x"]);

    let runs: Vec<_> = (0..2)
        .map(|_| {
            let service = service.clone();
            let tests = tree_items(&service, &["a\0x"]);
            tokio::spawn(async move {
                service.run_tests(AmbiguousRunRequest::new(tests), None).await
            })
        })
        .collect();
    while service.active_runs().len() < 2 {
        tokio::task::yield_now().await;
    }

    service.cancel_test_run(None);
    for run in runs {
        assert!(run.await.unwrap().is_complete());
    }
    assert_eq!(service.results().results().len(), 2);
}
