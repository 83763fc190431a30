// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The interface test controllers implement.

use crate::errors::ControllerError;
use futures::future::BoxFuture;
use testsync_metadata::RunTestForControllerRequest;
use tokio_util::sync::CancellationToken;

/// A producer of tests that can discover and run them.
///
/// Controllers publish their tests to a [`TestService`](crate::service::TestService)
/// as diffs through [`publish_diff`](crate::service::TestService::publish_diff),
/// and report run progress into the
/// [`LiveTestResult`](crate::results::LiveTestResult) for the run ID they're
/// given.
///
/// The returned futures must not borrow from the controller, since the service
/// awaits them after releasing its own locks.
pub trait TestController: Send + Sync {
    /// The stable ID of the controller. This is also the ID of its root test.
    fn id(&self) -> &str;

    /// A human-readable label.
    fn label(&self) -> &str;

    /// Opens the configuration for one of the controller's profiles.
    fn configure_run_profile(&self, profile_id: u32);

    /// Discovers the children of `test_id`, `levels` deep, publishing them as
    /// diffs.
    ///
    /// This may be called while the service's test tree is locked. Diffs must
    /// be published from the returned future, not before returning it.
    fn expand_test(
        &self,
        test_id: &str,
        levels: u32,
    ) -> BoxFuture<'static, Result<(), ControllerError>>;

    /// Runs tests.
    ///
    /// Controllers should stop promptly once `token` is cancelled, returning
    /// [`ControllerError::Cancelled`].
    fn run_tests(
        &self,
        request: RunTestForControllerRequest,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<(), ControllerError>>;
}
