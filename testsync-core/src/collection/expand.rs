// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Memoized expansion of lazily discovered subtrees.

use crate::errors::ControllerError;
use debug_ignore::DebugIgnore;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use smol_str::SmolStr;
use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

/// An in-flight or finished expansion of a test's children.
///
/// Every caller that asks for an expansion already covered by this one gets a
/// clone of the same future. Use [`Shared::ptr_eq`] to check whether two
/// callers share an underlying request.
pub type ExpandFuture = Shared<BoxFuture<'static, Result<(), ControllerError>>>;

/// Memo for a single node's expansion requests.
#[derive(Debug)]
pub(super) struct ExpandMemo {
    // Depth of the most recent request.
    pending_levels: u32,
    // Depth of the deepest request that finished successfully, or -1.
    done_levels: Arc<AtomicI64>,
    future: DebugIgnore<ExpandFuture>,
}

impl ExpandMemo {
    /// Returns a future for an expansion that covers `levels`, if any.
    ///
    /// This is the memoized future if it is deep enough and hasn't failed.
    /// Otherwise, if an earlier request already finished at least `levels`
    /// deep, it is an already-completed future.
    pub(super) fn covering(&self, levels: u32) -> Option<ExpandFuture> {
        if self.pending_levels >= levels && !matches!(self.future.peek(), Some(Err(_))) {
            return Some(self.future.0.clone());
        }
        if self.done_levels().is_some_and(|done| done >= levels) {
            return Some(future::ready(Ok(())).boxed().shared());
        }
        None
    }

    /// Returns the deepest depth that finished expanding.
    pub(super) fn done_levels(&self) -> Option<u32> {
        u32::try_from(self.done_levels.load(Ordering::Acquire)).ok()
    }

    /// Starts tracking a new expansion, replacing `previous` if any.
    ///
    /// The done depth carries over from `previous`, so a failing deeper
    /// request doesn't forget a shallower one that finished.
    pub(super) fn start(
        previous: Option<&ExpandMemo>,
        id: &SmolStr,
        levels: u32,
        request: BoxFuture<'static, Result<(), ControllerError>>,
    ) -> Self {
        let done_levels = previous.map_or_else(
            || Arc::new(AtomicI64::new(-1)),
            |memo| memo.done_levels.clone(),
        );
        let done = done_levels.clone();
        let id = id.clone();
        let future = async move {
            match request.await {
                Ok(()) => {
                    done.fetch_max(i64::from(levels), Ordering::AcqRel);
                    Ok(())
                }
                Err(error) => {
                    tracing::debug!(
                        test_id = %id.escape_debug(),
                        levels,
                        "expansion failed: {error}",
                    );
                    Err(error)
                }
            }
        }
        .boxed()
        .shared();

        Self {
            pending_levels: levels,
            done_levels,
            future: DebugIgnore(future),
        }
    }

    pub(super) fn future(&self) -> &ExpandFuture {
        &self.future
    }
}
