// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::expand::{ExpandFuture, ExpandMemo};
use crate::{
    computed_state::{ComputedStateAccessor, refresh_computed_state},
    errors::ControllerError,
};
use futures::future::BoxFuture;
use indexmap::{IndexMap, IndexSet, set};
use smol_str::SmolStr;
use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};
use testsync_metadata::{
    InternalTestItem, TestItemExpandState, TestResultState, TestTagDisplayInfo, TestsDiff,
    TestsDiffOp,
};
use tracing::{debug, warn};

/// Result state shown for a node in the tree view.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TreeState {
    /// The state of the node itself.
    pub own_state: TestResultState,

    /// The aggregated state of the node and its descendants.
    pub computed_state: TestResultState,

    /// The duration of the node itself.
    pub own_duration: Option<Duration>,

    /// The longest duration of the node and its descendants.
    pub computed_duration: Option<Duration>,

    /// True if the result this state came from is stale.
    pub retired: bool,
}

/// A test in the mirror, together with the IDs of its children.
#[derive(Clone, Debug)]
pub struct CollectionNode {
    item: InternalTestItem,
    children: IndexSet<SmolStr>,
    state: TreeState,
}

impl CollectionNode {
    fn new(item: InternalTestItem) -> Self {
        Self {
            item,
            children: IndexSet::new(),
            state: TreeState::default(),
        }
    }

    /// Returns the composite ID of the test.
    pub fn id(&self) -> &SmolStr {
        self.item.id()
    }

    /// Returns the test as last published by its controller.
    pub fn item(&self) -> &InternalTestItem {
        &self.item
    }

    /// Returns the IDs of the children currently in the mirror, in insertion
    /// order.
    pub fn children(&self) -> &IndexSet<SmolStr> {
        &self.children
    }

    /// Returns the tree-view result state.
    pub fn state(&self) -> &TreeState {
        &self.state
    }

    /// Returns true if this is a controller root.
    pub fn is_root(&self) -> bool {
        self.item.parent.is_none()
    }
}

/// A single change to the mirror, produced by [`TestCollection::apply`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CollectionChange {
    /// A test was added.
    Added(SmolStr),

    /// A test's properties or expand state changed.
    Updated(SmolStr),

    /// A test was removed.
    Removed {
        /// The removed test.
        item: InternalTestItem,

        /// False for the test named by the `Remove` op, true for descendants
        /// removed along with it.
        is_nested: bool,
    },

    /// A test's tree-view computed state or duration changed.
    StateChanged(SmolStr),
}

/// All changes produced by applying one diff.
///
/// Observers receive this as a single batch once the whole diff has been
/// applied.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CollectionChangeSet {
    /// Structural and state changes, in the order they happened.
    pub changes: Vec<CollectionChange>,

    /// IDs named by `Retire` ops.
    pub retired: Vec<SmolStr>,

    /// The new number of busy providers, if it changed.
    pub busy_providers: Option<usize>,

    /// The new pending root count, if it changed.
    pub pending_root_count: Option<i64>,

    /// True if the tag registry changed.
    pub tags_changed: bool,
}

impl CollectionChangeSet {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
            && self.retired.is_empty()
            && self.busy_providers.is_none()
            && self.pending_root_count.is_none()
            && !self.tags_changed
    }
}

/// The consumer-side mirror of every controller's test tree.
///
/// The mirror is only ever written through [`apply`](Self::apply), plus
/// tree-view result state through
/// [`apply_result_state`](Self::apply_result_state).
#[derive(Debug)]
pub struct TestCollection {
    items: HashMap<SmolStr, CollectionNode>,
    roots: IndexSet<SmolStr>,
    tags: IndexMap<SmolStr, TestTagDisplayInfo>,
    expansions: HashMap<SmolStr, ExpandMemo>,
    busy_providers: usize,
    pending_root_count: i64,
    warn_orphaned_adds: bool,
}

impl Default for TestCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCollection {
    /// Creates an empty mirror.
    pub fn new() -> Self {
        Self {
            items: HashMap::new(),
            roots: IndexSet::new(),
            tags: IndexMap::new(),
            expansions: HashMap::new(),
            busy_providers: 0,
            pending_root_count: 0,
            warn_orphaned_adds: true,
        }
    }

    /// Sets whether additions with an unknown parent are logged as warnings
    /// (the default) or at debug level.
    pub fn with_warn_orphaned_adds(mut self, warn_orphaned_adds: bool) -> Self {
        self.warn_orphaned_adds = warn_orphaned_adds;
        self
    }

    /// Applies a diff, in order, and returns everything that changed.
    ///
    /// Malformed ops are dropped: an `Add` whose parent is unknown, and an
    /// `Update` or `Remove` for an unknown test.
    pub fn apply(&mut self, diff: impl IntoIterator<Item = TestsDiffOp>) -> CollectionChangeSet {
        let mut changes = CollectionChangeSet::default();
        let prev_busy = self.busy_providers;
        let prev_pending = self.pending_root_count;

        for op in diff {
            match op {
                TestsDiffOp::Add(item) => self.add(item, &mut changes),
                TestsDiffOp::Update(update) => {
                    let Some(node) = self.items.get_mut(&update.ext_id) else {
                        continue;
                    };
                    if let Some(expand) = update.expand {
                        if node.item.expand == TestItemExpandState::BusyExpanding {
                            self.busy_providers -= 1;
                        }
                        if expand == TestItemExpandState::BusyExpanding {
                            self.busy_providers += 1;
                        }
                    }
                    node.item.apply_update(&update);
                    changes.changes.push(CollectionChange::Updated(update.ext_id));
                }
                TestsDiffOp::Remove(id) => self.remove(&id, &mut changes),
                TestsDiffOp::Retire(id) => changes.retired.push(id),
                TestsDiffOp::IncrementPendingRoots(delta) => self.pending_root_count += delta,
                TestsDiffOp::AddTag(tag) => {
                    self.tags.insert(tag.id.clone(), tag);
                    changes.tags_changed = true;
                }
                TestsDiffOp::RemoveTag(id) => {
                    changes.tags_changed |= self.tags.shift_remove(&id).is_some();
                }
            }
        }

        if self.busy_providers != prev_busy {
            changes.busy_providers = Some(self.busy_providers);
        }
        if self.pending_root_count != prev_pending {
            changes.pending_root_count = Some(self.pending_root_count);
        }
        changes
    }

    fn add(&mut self, item: InternalTestItem, changes: &mut CollectionChangeSet) {
        let id = item.id().clone();
        if self.items.contains_key(&id) {
            // A re-added test starts over with no children.
            self.remove(&id, changes);
        }

        match &item.parent {
            None => {
                self.roots.insert(id.clone());
            }
            Some(parent_id) => {
                let Some(parent) = self.items.get_mut(parent_id) else {
                    if self.warn_orphaned_adds {
                        warn!(
                            test_id = %id.escape_debug(),
                            parent_id = %parent_id.escape_debug(),
                            "dropping test whose parent is not in the tree",
                        );
                    } else {
                        debug!(
                            test_id = %id.escape_debug(),
                            parent_id = %parent_id.escape_debug(),
                            "dropping test whose parent is not in the tree",
                        );
                    }
                    return;
                };
                parent.children.insert(id.clone());
            }
        }

        if item.expand == TestItemExpandState::BusyExpanding {
            self.busy_providers += 1;
        }
        let parent = item.parent.clone();
        self.items.insert(id.clone(), CollectionNode::new(item));
        changes.changes.push(CollectionChange::Added(id));

        if let Some(parent) = parent {
            self.refresh_state(&parent, None, changes);
        }
    }

    fn remove(&mut self, id: &str, changes: &mut CollectionChangeSet) {
        let Some(target) = self.items.get(id) else {
            return;
        };
        let parent = target.item.parent.clone();
        match &parent {
            None => {
                self.roots.shift_remove(id);
            }
            Some(parent_id) => {
                if let Some(parent) = self.items.get_mut(parent_id) {
                    parent.children.shift_remove(id);
                }
            }
        }

        let mut queue = VecDeque::from([SmolStr::new(id)]);
        let mut is_nested = false;
        while let Some(next) = queue.pop_front() {
            let Some(node) = self.items.remove(&next) else {
                continue;
            };
            self.expansions.remove(&next);
            if node.item.expand == TestItemExpandState::BusyExpanding {
                self.busy_providers -= 1;
            }
            queue.extend(node.children);
            changes.changes.push(CollectionChange::Removed {
                item: node.item,
                is_nested,
            });
            is_nested = true;
        }

        if let Some(parent) = parent {
            self.refresh_state(&parent, None, changes);
        }
    }

    fn refresh_state(
        &mut self,
        id: &SmolStr,
        explicit_state: Option<TestResultState>,
        changes: &mut CollectionChangeSet,
    ) {
        let changed = refresh_computed_state(&mut self.tree_states(), id, explicit_state);
        changes
            .changes
            .extend(changed.into_iter().map(CollectionChange::StateChanged));
    }

    /// Sets the tree-view result state of a test and re-aggregates its
    /// ancestors.
    ///
    /// `explicit_computed` overrides the aggregated state of the test itself,
    /// for tests whose descendants have results that aren't in the mirror.
    ///
    /// Returns the IDs whose tree state changed. An unknown test changes
    /// nothing.
    pub fn apply_result_state(
        &mut self,
        test_id: &str,
        own_state: TestResultState,
        own_duration: Option<Duration>,
        retired: bool,
        explicit_computed: Option<TestResultState>,
    ) -> IndexSet<SmolStr> {
        let Some(node) = self.items.get_mut(test_id) else {
            return IndexSet::new();
        };
        let id = node.id().clone();
        node.state.own_state = own_state;
        node.state.own_duration = own_duration;
        let retired_changed = node.state.retired != retired;
        node.state.retired = retired;

        let mut changed = refresh_computed_state(&mut self.tree_states(), &id, explicit_computed);
        if retired_changed {
            changed.insert(id);
        }
        changed
    }

    fn tree_states(&mut self) -> TreeStates<'_> {
        TreeStates {
            items: &mut self.items,
        }
    }

    /// Requests that a test's children be discovered `levels` deep.
    ///
    /// If an earlier request for this test already covers `levels` and hasn't
    /// failed, its future is returned and `request` is not called. Otherwise
    /// `request` is called to ask the controller, and its result replaces the
    /// memo.
    ///
    /// Returns `None` if the test isn't in the mirror.
    pub fn expand<F>(&mut self, id: &str, levels: u32, request: F) -> Option<ExpandFuture>
    where
        F: FnOnce(&SmolStr, u32) -> BoxFuture<'static, Result<(), ControllerError>>,
    {
        let node = self.items.get(id)?;
        let previous = self.expansions.get(id);
        if let Some(future) = previous.and_then(|memo| memo.covering(levels)) {
            return Some(future);
        }

        let memo = ExpandMemo::start(previous, node.id(), levels, request(node.id(), levels));
        let future = memo.future().clone();
        self.expansions.insert(node.id().clone(), memo);
        Some(future)
    }

    /// Returns the deepest level to which a test has finished expanding.
    pub fn expanded_levels(&self, id: &str) -> Option<u32> {
        self.expansions.get(id)?.done_levels()
    }

    /// Looks up a test by composite ID.
    pub fn get_node_by_id(&self, id: &str) -> Option<&CollectionNode> {
        self.items.get(id)
    }

    /// Returns the IDs of the controller roots.
    pub fn root_ids(&self) -> impl ExactSizeIterator<Item = &SmolStr> + '_ {
        self.roots.iter()
    }

    /// Returns the controller roots.
    pub fn root_items(&self) -> impl Iterator<Item = &CollectionNode> + '_ {
        self.roots.iter().filter_map(|id| self.items.get(id))
    }

    /// Returns the IDs of the roots published by one controller.
    pub fn root_ids_for_controller(&self, controller_id: &str) -> Vec<SmolStr> {
        self.root_items()
            .filter(|node| node.item.controller_id == controller_id)
            .map(|node| node.id().clone())
            .collect()
    }

    /// Iterates over every node. Parents are returned before their children.
    pub fn all(&self) -> AllNodes<'_> {
        AllNodes {
            collection: self,
            current: self.roots.iter(),
            pending: Vec::new(),
        }
    }

    /// Returns the number of tests in the mirror.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the mirror holds no tests.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the tag registry.
    pub fn tags(&self) -> &IndexMap<SmolStr, TestTagDisplayInfo> {
        &self.tags
    }

    /// Returns the number of tests whose controller is currently expanding
    /// them.
    pub fn busy_providers(&self) -> usize {
        self.busy_providers
    }

    /// Returns the number of controllers yet to publish their roots.
    pub fn pending_root_count(&self) -> i64 {
        self.pending_root_count
    }

    /// Returns a self-contained diff that rebuilds this mirror from scratch.
    ///
    /// The diff starts with the pending root count, followed by an `Add` for
    /// every test, parents first. Tags are not included.
    pub fn get_reviver_diff(&self) -> TestsDiff {
        let mut diff = vec![TestsDiffOp::IncrementPendingRoots(
            self.pending_root_count,
        )];
        diff.extend(self.all().map(|node| TestsDiffOp::Add(node.item.clone())));
        diff
    }

    /// Removes every test, returning the diff that does the same for another
    /// mirror.
    pub fn clear(&mut self) -> TestsDiff {
        let diff = self
            .roots
            .drain(..)
            .map(TestsDiffOp::Remove)
            .collect();
        self.items.clear();
        self.expansions.clear();
        self.busy_providers = 0;
        diff
    }
}

/// Iterator returned by [`TestCollection::all`].
///
/// Siblings are visited in insertion order. After a set of siblings, the
/// children of the last sibling are visited first.
#[derive(Debug)]
pub struct AllNodes<'a> {
    collection: &'a TestCollection,
    current: set::Iter<'a, SmolStr>,
    pending: Vec<set::Iter<'a, SmolStr>>,
}

impl<'a> Iterator for AllNodes<'a> {
    type Item = &'a CollectionNode;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(id) = self.current.next() {
                let Some(node) = self.collection.items.get(id) else {
                    continue;
                };
                self.pending.push(node.children.iter());
                return Some(node);
            }
            self.current = self.pending.pop()?;
        }
    }
}

struct TreeStates<'a> {
    items: &'a mut HashMap<SmolStr, CollectionNode>,
}

impl ComputedStateAccessor for TreeStates<'_> {
    type Node = SmolStr;

    fn own_state(&self, node: &SmolStr) -> TestResultState {
        self.items
            .get(node)
            .map_or_else(TestResultState::default, |n| n.state.own_state)
    }

    fn computed_state(&self, node: &SmolStr) -> TestResultState {
        self.items
            .get(node)
            .map_or_else(TestResultState::default, |n| n.state.computed_state)
    }

    fn set_computed_state(&mut self, node: &SmolStr, state: TestResultState) {
        if let Some(n) = self.items.get_mut(node) {
            n.state.computed_state = state;
        }
    }

    fn own_duration(&self, node: &SmolStr) -> Option<Duration> {
        self.items.get(node)?.state.own_duration
    }

    fn computed_duration(&self, node: &SmolStr) -> Option<Duration> {
        self.items.get(node)?.state.computed_duration
    }

    fn set_computed_duration(&mut self, node: &SmolStr, duration: Option<Duration>) {
        if let Some(n) = self.items.get_mut(node) {
            n.state.computed_duration = duration;
        }
    }

    fn children(&self, node: &SmolStr) -> Vec<SmolStr> {
        self.items
            .get(node)
            .map(|n| n.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn parent(&self, node: &SmolStr) -> Option<SmolStr> {
        self.items.get(node)?.item.parent.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::{
        collections::BTreeSet,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };
    use test_strategy::proptest;
    use testsync_metadata::{TestId, TestItem, TestItemUpdate};
    use tokio::sync::oneshot;

    fn item(id: &str, expand: TestItemExpandState) -> InternalTestItem {
        let test_id = TestId::from_string(id).unwrap();
        InternalTestItem {
            controller_id: test_id.controller_id().into(),
            expand,
            parent: test_id.parent_id().map(|parent| SmolStr::from(&parent)),
            item: TestItem::new(id, test_id.local_id()),
        }
    }

    fn add(id: &str) -> TestsDiffOp {
        TestsDiffOp::Add(item(id, TestItemExpandState::NotExpandable))
    }

    fn child_ids(collection: &TestCollection, id: &str) -> Vec<SmolStr> {
        collection
            .get_node_by_id(id)
            .unwrap()
            .children()
            .iter()
            .cloned()
            .collect()
    }

    fn removed(changes: &CollectionChangeSet) -> Vec<(SmolStr, bool)> {
        changes
            .changes
            .iter()
            .filter_map(|change| match change {
                CollectionChange::Removed { item, is_nested } => Some((item.id().clone(), *is_nested)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn children_accumulate_across_diffs() {
        let mut collection = TestCollection::new();
        collection.apply([add("r1"), add("r1\0c1")]);
        let changes = collection.apply([add("r1\0c2")]);

        assert_eq!(
            changes.changes,
            vec![CollectionChange::Added("r1\0c2".into())]
        );
        assert_eq!(
            collection.root_ids().cloned().collect::<Vec<_>>(),
            vec![SmolStr::new("r1")]
        );
        assert_eq!(child_ids(&collection, "r1"), vec!["r1\0c1", "r1\0c2"]);
        assert!(collection.get_node_by_id("r1\0c2").unwrap().children().is_empty());
    }

    #[test]
    fn remove_cascades() {
        let mut collection = TestCollection::new();
        collection.apply([add("r1"), add("r1\0c1"), add("r1\0c2")]);

        let changes = collection.apply([TestsDiffOp::Remove("r1".into())]);
        assert_eq!(
            removed(&changes),
            vec![
                ("r1".into(), false),
                ("r1\0c1".into(), true),
                ("r1\0c2".into(), true),
            ]
        );
        assert!(collection.is_empty());
        assert_eq!(collection.root_ids().len(), 0);
        for id in ["r1", "r1\0c1", "r1\0c2"] {
            assert!(collection.get_node_by_id(id).is_none(), "{id:?} was removed");
        }
    }

    #[test]
    fn remove_detaches_from_parent() {
        let mut collection = TestCollection::new();
        collection.apply([add("r"), add("r\0a"), add("r\0a\0x"), add("r\0b")]);

        let changes = collection.apply([TestsDiffOp::Remove("r\0a".into())]);
        assert_eq!(
            removed(&changes),
            vec![("r\0a".into(), false), ("r\0a\0x".into(), true)]
        );
        assert_eq!(child_ids(&collection, "r"), vec!["r\0b"]);
    }

    #[test]
    fn orphaned_add_is_dropped() {
        let mut collection = TestCollection::new().with_warn_orphaned_adds(false);
        let changes = collection.apply([add("r\0a"), add("r")]);

        assert_eq!(changes.changes, vec![CollectionChange::Added("r".into())]);
        assert!(collection.get_node_by_id("r\0a").is_none());
        assert!(child_ids(&collection, "r").is_empty());
    }

    #[test]
    fn unknown_update_and_remove_are_ignored() {
        let mut collection = TestCollection::new();
        let changes = collection.apply([
            TestsDiffOp::Update(TestItemUpdate::new("nope")),
            TestsDiffOp::Remove("nope".into()),
        ]);
        assert!(changes.is_empty());
    }

    #[test]
    fn busy_providers_follow_expand_state() {
        let mut collection = TestCollection::new();
        let changes = collection.apply([
            TestsDiffOp::Add(item("r", TestItemExpandState::BusyExpanding)),
            TestsDiffOp::Add(item("r\0a", TestItemExpandState::BusyExpanding)),
        ]);
        assert_eq!(changes.busy_providers, Some(2));

        let changes = collection.apply([TestsDiffOp::Update(
            TestItemUpdate::new("r").with_expand(TestItemExpandState::Expanded),
        )]);
        assert_eq!(changes.busy_providers, Some(1));
        assert_eq!(
            collection.get_node_by_id("r").unwrap().item().expand,
            TestItemExpandState::Expanded
        );

        let changes = collection.apply([TestsDiffOp::Remove("r".into())]);
        assert_eq!(changes.busy_providers, Some(0));
        assert_eq!(collection.busy_providers(), 0);
    }

    #[test]
    fn retire_tags_and_pending_roots() {
        let mut collection = TestCollection::new();
        let changes = collection.apply([
            TestsDiffOp::IncrementPendingRoots(2),
            TestsDiffOp::AddTag(TestTagDisplayInfo {
                id: "slow".into(),
                ctrl_label: "Ctrl".to_owned(),
            }),
            TestsDiffOp::Retire("r".into()),
        ]);
        assert_eq!(changes.pending_root_count, Some(2));
        assert!(changes.tags_changed);
        assert_eq!(changes.retired, vec![SmolStr::new("r")]);
        assert!(changes.changes.is_empty(), "retire is not structural");
        assert!(collection.tags().contains_key("slow"));

        let changes = collection.apply([
            TestsDiffOp::IncrementPendingRoots(-2),
            TestsDiffOp::RemoveTag("slow".into()),
        ]);
        assert_eq!(changes.pending_root_count, Some(0));
        assert!(collection.tags().is_empty());
    }

    #[test]
    fn readd_replaces_subtree() {
        let mut collection = TestCollection::new();
        collection.apply([add("r"), add("r\0a"), add("r\0a\0x")]);

        let changes = collection.apply([add("r\0a")]);
        assert_eq!(
            removed(&changes),
            vec![("r\0a".into(), false), ("r\0a\0x".into(), true)]
        );
        assert!(collection.get_node_by_id("r\0a\0x").is_none());
        assert_eq!(child_ids(&collection, "r"), vec!["r\0a"]);
    }

    #[test]
    fn reviver_diff_rebuilds_tree() {
        let mut collection = TestCollection::new();
        collection.apply([
            TestsDiffOp::IncrementPendingRoots(1),
            add("r1"),
            add("r2"),
            add("r1\0a"),
            add("r2\0b"),
            add("r2\0b\0x"),
        ]);

        let diff = collection.get_reviver_diff();
        let ids: Vec<_> = diff
            .iter()
            .map(|op| match op {
                TestsDiffOp::IncrementPendingRoots(n) => format!("+{n}"),
                TestsDiffOp::Add(item) => item.id().to_string(),
                other => panic!("unexpected op {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec!["+1", "r1", "r2", "r2\0b", "r2\0b\0x", "r1\0a"]);

        let mut revived = TestCollection::new();
        revived.apply(diff);
        assert_eq!(revived.len(), collection.len());
        assert_eq!(revived.pending_root_count(), 1);
        assert_eq!(child_ids(&revived, "r2\0b"), vec!["r2\0b\0x"]);
    }

    #[test]
    fn clear_returns_root_removals() {
        let mut collection = TestCollection::new();
        collection.apply([add("r1"), add("r1\0a"), add("r2")]);

        let diff = collection.clear();
        assert_eq!(
            diff,
            vec![
                TestsDiffOp::Remove("r1".into()),
                TestsDiffOp::Remove("r2".into())
            ]
        );
        assert!(collection.is_empty());
        assert_eq!(collection.all().count(), 0);
    }

    #[test]
    fn result_state_aggregates_up_the_tree() {
        let mut collection = TestCollection::new();
        collection.apply([add("r"), add("r\0a"), add("r\0b")]);

        let changed = collection.apply_result_state(
            "r\0a",
            TestResultState::Failed,
            Some(Duration::from_millis(5)),
            false,
            None,
        );
        assert_eq!(
            changed.into_iter().collect::<Vec<_>>(),
            vec![SmolStr::new("r\0a"), SmolStr::new("r")]
        );
        let root = collection.get_node_by_id("r").unwrap().state();
        assert_eq!(root.computed_state, TestResultState::Failed);
        assert_eq!(root.computed_duration, Some(Duration::from_millis(5)));

        // Removing the failing child re-aggregates the root.
        let changes = collection.apply([TestsDiffOp::Remove("r\0a".into())]);
        assert!(changes
            .changes
            .contains(&CollectionChange::StateChanged("r".into())));
        let root = collection.get_node_by_id("r").unwrap().state();
        assert_eq!(root.computed_state, TestResultState::Unset);
        assert_eq!(root.computed_duration, None);
    }

    #[test]
    fn retired_flag_is_reported() {
        let mut collection = TestCollection::new();
        collection.apply([add("r")]);
        let changed =
            collection.apply_result_state("r", TestResultState::Unset, None, true, None);
        assert_eq!(changed.into_iter().collect::<Vec<_>>(), vec![SmolStr::new("r")]);
        assert!(collection.get_node_by_id("r").unwrap().state().retired);
        assert!(
            collection
                .apply_result_state("missing", TestResultState::Passed, None, false, None)
                .is_empty()
        );
    }

    fn counting_request(
        calls: &Arc<AtomicUsize>,
    ) -> (
        impl FnOnce(&SmolStr, u32) -> BoxFuture<'static, Result<(), ControllerError>>,
        oneshot::Sender<Result<(), ControllerError>>,
    ) {
        let (tx, rx) = oneshot::channel();
        let calls = calls.clone();
        let request = move |_: &SmolStr, _: u32| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { rx.await.unwrap_or(Err(ControllerError::Cancelled)) }.boxed()
        };
        (request, tx)
    }

    #[tokio::test]
    async fn concurrent_expansions_share_a_request() {
        let mut collection = TestCollection::new();
        collection.apply([TestsDiffOp::Add(item("r", TestItemExpandState::Expandable))]);
        let calls = Arc::new(AtomicUsize::new(0));

        let (request, tx) = counting_request(&calls);
        let first = collection.expand("r", 2, request).unwrap();
        let (request, _unused) = counting_request(&calls);
        let second = collection.expand("r", 2, request).unwrap();

        assert!(first.ptr_eq(&second), "both callers get the same future");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tx.send(Ok(())).unwrap();
        assert_eq!(first.await, Ok(()));
        assert_eq!(second.await, Ok(()));
        assert_eq!(collection.expanded_levels("r"), Some(2));

        // A shallower request is still covered once complete.
        let (request, _unused) = counting_request(&calls);
        collection.expand("r", 1, request).unwrap().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deeper_or_failed_expansions_are_reissued() {
        let mut collection = TestCollection::new();
        collection.apply([TestsDiffOp::Add(item("r", TestItemExpandState::Expandable))]);
        let calls = Arc::new(AtomicUsize::new(0));

        let (request, tx) = counting_request(&calls);
        let first = collection.expand("r", 1, request).unwrap();
        tx.send(Err(ControllerError::failed("boom"))).unwrap();
        assert_eq!(first.await, Err(ControllerError::failed("boom")));
        assert_eq!(collection.expanded_levels("r"), None);

        let (request, tx) = counting_request(&calls);
        let retry = collection.expand("r", 1, request).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2, "failed expansion is retried");
        tx.send(Ok(())).unwrap();
        retry.await.unwrap();

        let (request, tx) = counting_request(&calls);
        let deeper = collection.expand("r", 3, request).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3, "deeper expansion is requested");
        tx.send(Ok(())).unwrap();
        deeper.await.unwrap();
        assert_eq!(collection.expanded_levels("r"), Some(3));
    }

    #[tokio::test]
    async fn failed_deeper_expansion_keeps_shallower_result() {
        let mut collection = TestCollection::new();
        collection.apply([TestsDiffOp::Add(item("r", TestItemExpandState::Expandable))]);
        let calls = Arc::new(AtomicUsize::new(0));

        let (request, tx) = counting_request(&calls);
        let shallow = collection.expand("r", 1, request).unwrap();
        tx.send(Ok(())).unwrap();
        shallow.await.unwrap();

        let (request, tx) = counting_request(&calls);
        let deeper = collection.expand("r", 3, request).unwrap();
        tx.send(Err(ControllerError::failed("boom"))).unwrap();
        assert_eq!(deeper.await, Err(ControllerError::failed("boom")));
        assert_eq!(collection.expanded_levels("r"), Some(1));

        let (request, _unused) = counting_request(&calls);
        let again = collection.expand("r", 1, request).unwrap();
        assert_eq!(again.await, Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 2, "finished depth is not requested again");

        let (request, _unused) = counting_request(&calls);
        let _retry = collection.expand("r", 3, request).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3, "failed depth is requested again");
    }

    #[test]
    fn expand_unknown_test_is_none() {
        let mut collection = TestCollection::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (request, _tx) = counting_request(&calls);
        assert!(collection.expand("nope", 1, request).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    const IDS: [&str; 6] = ["r", "r\0a", "r\0b", "r\0a\0x", "r\0a\0y", "s"];

    fn arb_op() -> impl Strategy<Value = TestsDiffOp> {
        let index = 0..IDS.len();
        prop_oneof![
            3 => (index.clone(), any::<bool>()).prop_map(|(i, busy)| {
                let expand = if busy {
                    TestItemExpandState::BusyExpanding
                } else {
                    TestItemExpandState::Expandable
                };
                TestsDiffOp::Add(item(IDS[i], expand))
            }),
            1 => (index.clone(), any::<bool>()).prop_map(|(i, busy)| {
                let expand = if busy {
                    TestItemExpandState::BusyExpanding
                } else {
                    TestItemExpandState::Expanded
                };
                TestsDiffOp::Update(TestItemUpdate::new(IDS[i]).with_expand(expand))
            }),
            1 => index.prop_map(|i| TestsDiffOp::Remove(IDS[i].into())),
        ]
    }

    fn check_invariants(collection: &TestCollection) -> Result<(), TestCaseError> {
        let mut busy = 0;
        for node in collection.all() {
            let expected: BTreeSet<&SmolStr> = collection
                .items
                .values()
                .filter(|other| other.item.parent.as_ref() == Some(node.id()))
                .map(|other| other.id())
                .collect();
            let actual: BTreeSet<&SmolStr> = node.children().iter().collect();
            prop_assert_eq!(expected, actual);
            if node.item.expand == TestItemExpandState::BusyExpanding {
                busy += 1;
            }
        }
        prop_assert_eq!(collection.all().count(), collection.len(), "every node is reachable");
        prop_assert_eq!(collection.busy_providers(), busy);
        Ok(())
    }

    #[proptest]
    fn tree_invariants_hold(
        #[strategy(prop::collection::vec(prop::collection::vec(arb_op(), 1..6), 1..12))]
        diffs: Vec<Vec<TestsDiffOp>>,
    ) {
        let mut collection = TestCollection::new().with_warn_orphaned_adds(false);
        for diff in diffs {
            collection.apply(diff);
            check_invariants(&collection)?;
        }
    }

    #[proptest]
    fn reviver_diff_round_trips(
        #[strategy(prop::collection::vec(arb_op(), 1..20))] diff: Vec<TestsDiffOp>,
    ) {
        let mut collection = TestCollection::new().with_warn_orphaned_adds(false);
        collection.apply(diff);

        let mut revived = TestCollection::new();
        revived.apply(collection.get_reviver_diff());
        prop_assert_eq!(revived.len(), collection.len());
        prop_assert_eq!(revived.busy_providers(), collection.busy_providers());
        for node in collection.all() {
            let other = revived.get_node_by_id(node.id());
            prop_assert!(other.is_some());
            prop_assert_eq!(other.map(|n| n.children()), Some(node.children()));
        }
    }
}
