// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use pretty_assertions::assert_eq;
use smol_str::SmolStr;
use testsync_core::{collection::CollectionChange, errors::ExpandTestError};
use testsync_metadata::{TestResultState, TestsDiffOp};

#[tokio::test]
async fn concurrent_expansions_share_one_controller_call() {
    let service = service();
    let controller = FakeController::new(&service, "a", RunBehavior::Hang);
    let _registration = controller.register(&["x"]);

    let (first, second) = futures::join!(service.expand("a\0x", 2), service.expand("a\0x", 2));
    first.unwrap();
    second.unwrap();
    assert_eq!(controller.expand_calls(), 1);

    service.with_collection(|collection| {
        assert!(collection.get_node_by_id("a\0x\0child\0child").is_some());
        assert_eq!(collection.expanded_levels("a\0x"), Some(2));
    });

    // A shallower request is already covered.
    service.expand("a\0x", 1).await.unwrap();
    assert_eq!(controller.expand_calls(), 1);

    // expand_test always reaches the controller.
    service.expand_test("a\0x", 1).await.unwrap();
    assert_eq!(controller.expand_calls(), 2);
}

#[tokio::test]
async fn expand_needs_a_registered_controller() {
    let service = service();
    assert_eq!(
        service.expand("nope\0x", 1).await,
        Err(ExpandTestError::UnknownController {
            controller_id: "nope".into(),
            test_id: "nope\0x".into(),
        })
    );
}

#[tokio::test]
async fn expand_of_unknown_test_is_ignored() {
    let service = service();
    let controller = FakeController::new(&service, "a", RunBehavior::Hang);
    let _registration = controller.register(&[]);

    service.expand("a\0missing", 1).await.unwrap();
    assert_eq!(controller.expand_calls(), 0);
}

#[test]
fn dispose_removes_roots_and_profiles() {
    let service = service();
    let a = FakeController::new(&service, "a", RunBehavior::Hang);
    let b = FakeController::new(&service, "b", RunBehavior::Hang);
    let registration = a.register(&["x", "y"]);
    let _b = b.register(&[]);
    let mut diffs = service.subscribe_diffs();
    let count = service.subscribe_controller_count();
    assert_eq!(*count.borrow(), 2);

    registration.dispose();

    let event = diffs.try_recv().unwrap();
    assert_eq!(event.controller_id, "a");
    assert_eq!(event.diff, vec![TestsDiffOp::Remove("a".into())]);
    let removed: Vec<(SmolStr, bool)> = event
        .changes
        .changes
        .iter()
        .filter_map(|change| match change {
            CollectionChange::Removed { item, is_nested } => Some((item.id().clone(), *is_nested)),
            _ => None,
        })
        .collect();
    assert_eq!(
        removed,
        vec![
            (SmolStr::new("a"), false),
            (SmolStr::new("a\0x"), true),
            (SmolStr::new("a\0y"), true),
        ]
    );

    assert_eq!(*count.borrow(), 1);
    service.with_collection(|collection| {
        assert_eq!(collection.root_ids().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(collection.len(), 1);
    });
    service.with_profiles(|profiles| {
        assert!(profiles.get_controller_profiles("a").is_empty());
        assert_eq!(profiles.get_controller_profiles("b").len(), 1);
    });
}

#[tokio::test]
async fn retire_marks_earlier_results() {
    let service = service();
    let controller = FakeController::new(&service, "a", RunBehavior::Report(TestResultState::Passed));
    let _registration = controller.register(&["x", "y"]);

    let tests = tree_items(&service, &["a"]);
    let result = service
        .run_tests(testsync_core::service::AmbiguousRunRequest::new(tests), None)
        .await;
    assert_eq!(
        result.get_state_by_id("a").unwrap().computed_state,
        TestResultState::Passed
    );

    service.publish_diff("a", vec![TestsDiffOp::Retire("a".into())]);
    assert!(result.get_state_by_id("a").unwrap().retired);
    let (newest, item) = service.results().state_by_id("a").unwrap();
    assert!(newest.ptr_eq(&result));
    assert!(item.retired);
}
