// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bottom-up aggregation of result states and durations.
//!
//! Every node in a test tree has an *own* state (the outcome of running that
//! node directly) and a *computed* state: the highest-priority state among its
//! own state and the computed states of its children (see
//! [`TestResultState::priority`]). Durations aggregate the same way, using the
//! longest duration instead of priority.
//!
//! The same routine maintains both the shared tree mirror and each run's
//! private result tree. Both describe their nodes through a
//! [`ComputedStateAccessor`], addressing nodes by handle rather than by
//! reference.

use indexmap::IndexSet;
use std::{hash::Hash, time::Duration};
use testsync_metadata::TestResultState;

/// Read and write access to the aggregation fields of a tree of nodes.
pub trait ComputedStateAccessor {
    /// A handle identifying a node.
    type Node: Clone + Eq + Hash;

    /// Returns the node's own state.
    fn own_state(&self, node: &Self::Node) -> TestResultState;

    /// Returns the node's current computed state.
    fn computed_state(&self, node: &Self::Node) -> TestResultState;

    /// Sets the node's computed state.
    fn set_computed_state(&mut self, node: &Self::Node, state: TestResultState);

    /// Returns the node's own duration.
    fn own_duration(&self, node: &Self::Node) -> Option<Duration>;

    /// Returns the node's current computed duration.
    fn computed_duration(&self, node: &Self::Node) -> Option<Duration>;

    /// Sets the node's computed duration.
    fn set_computed_duration(&mut self, node: &Self::Node, duration: Option<Duration>);

    /// Returns handles to the node's children.
    fn children(&self, node: &Self::Node) -> Vec<Self::Node>;

    /// Returns the node's parent, or `None` for a root.
    fn parent(&self, node: &Self::Node) -> Option<Self::Node>;

    /// Returns the node's ancestors, nearest first.
    fn ancestors(&self, node: &Self::Node) -> Vec<Self::Node> {
        let mut ancestors = Vec::new();
        let mut current = self.parent(node);
        while let Some(parent) = current {
            current = self.parent(&parent);
            ancestors.push(parent);
        }
        ancestors
    }
}

/// Computes a node's state from its own state and its children's current
/// computed states.
pub fn compute_state<A: ComputedStateAccessor>(accessor: &A, node: &A::Node) -> TestResultState {
    accessor
        .children(node)
        .iter()
        .map(|child| accessor.computed_state(child))
        .fold(accessor.own_state(node), TestResultState::max_priority)
}

/// Computes a node's duration from its own duration and its children's
/// current computed durations.
pub fn compute_duration<A: ComputedStateAccessor>(
    accessor: &A,
    node: &A::Node,
) -> Option<Duration> {
    accessor
        .children(node)
        .iter()
        .map(|child| accessor.computed_duration(child))
        .fold(accessor.own_duration(node), Ord::max)
}

/// Recomputes the state and duration of `node` after a change to its own
/// values (or to its set of children), and propagates the change upwards
/// until a node's computed values stop changing.
///
/// If `explicit_state` is given, it is used as the node's new computed state
/// instead of aggregating its children. This is for leaves whose children are
/// known elsewhere but not materialized in this tree.
///
/// Returns every node whose computed state or duration changed, in the order
/// they were first changed, so callers can fire exactly the necessary
/// notifications.
pub fn refresh_computed_state<A: ComputedStateAccessor>(
    accessor: &mut A,
    node: &A::Node,
    explicit_state: Option<TestResultState>,
) -> IndexSet<A::Node> {
    let mut changed = IndexSet::new();

    let mut explicit_state = explicit_state;
    let mut current = Some(node.clone());
    while let Some(n) = current {
        let new_state = explicit_state
            .take()
            .unwrap_or_else(|| compute_state(accessor, &n));
        if new_state == accessor.computed_state(&n) {
            break;
        }
        accessor.set_computed_state(&n, new_state);
        current = accessor.parent(&n);
        changed.insert(n);
    }

    let mut current = Some(node.clone());
    while let Some(n) = current {
        let new_duration = compute_duration(accessor, &n);
        if new_duration == accessor.computed_duration(&n) {
            break;
        }
        accessor.set_computed_duration(&n, new_duration);
        current = accessor.parent(&n);
        changed.insert(n);
    }

    changed
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use super::*;
    use std::collections::HashMap;

    /// A minimal arena for exercising the aggregator directly.
    #[derive(Debug, Default)]
    pub(crate) struct Arena {
        pub(crate) nodes: HashMap<u32, ArenaNode>,
    }

    #[derive(Debug, Default)]
    pub(crate) struct ArenaNode {
        pub(crate) parent: Option<u32>,
        pub(crate) children: Vec<u32>,
        pub(crate) own: TestResultState,
        pub(crate) computed: TestResultState,
        pub(crate) own_duration: Option<Duration>,
        pub(crate) duration: Option<Duration>,
    }

    impl Arena {
        pub(crate) fn insert(&mut self, id: u32, parent: Option<u32>) {
            self.nodes.insert(
                id,
                ArenaNode {
                    parent,
                    ..Default::default()
                },
            );
            if let Some(parent) = parent {
                self.nodes.get_mut(&parent).unwrap().children.push(id);
            }
        }

        pub(crate) fn set_own(&mut self, id: u32, state: TestResultState) -> IndexSet<u32> {
            self.nodes.get_mut(&id).unwrap().own = state;
            refresh_computed_state(self, &id, None)
        }

        pub(crate) fn computed(&self, id: u32) -> TestResultState {
            self.nodes[&id].computed
        }
    }

    impl ComputedStateAccessor for Arena {
        type Node = u32;

        fn own_state(&self, node: &u32) -> TestResultState {
            self.nodes[node].own
        }

        fn computed_state(&self, node: &u32) -> TestResultState {
            self.nodes[node].computed
        }

        fn set_computed_state(&mut self, node: &u32, state: TestResultState) {
            self.nodes.get_mut(node).unwrap().computed = state;
        }

        fn own_duration(&self, node: &u32) -> Option<Duration> {
            self.nodes[node].own_duration
        }

        fn computed_duration(&self, node: &u32) -> Option<Duration> {
            self.nodes[node].duration
        }

        fn set_computed_duration(&mut self, node: &u32, duration: Option<Duration>) {
            self.nodes.get_mut(node).unwrap().duration = duration;
        }

        fn children(&self, node: &u32) -> Vec<u32> {
            self.nodes[node].children.clone()
        }

        fn parent(&self, node: &u32) -> Option<u32> {
            self.nodes[node].parent
        }
    }
}
