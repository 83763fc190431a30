// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Deserializer, Serialize};
use smol_str::SmolStr;

/// A zero-based position in a source file.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Line number, starting at 0.
    pub line: u32,

    /// Character offset within the line, starting at 0.
    pub character: u32,
}

/// A half-open range in a source file.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Range {
    /// Start of the range.
    pub start: Position,

    /// End of the range.
    pub end: Position,
}

/// A range within a particular document.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// The document URI.
    pub uri: String,

    /// The range within the document.
    pub range: Range,
}

/// A test as described by the controller that owns it, without children.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestItem {
    /// The composite ID of the test. See [`TestId`](crate::TestId).
    pub ext_id: SmolStr,

    /// Human-readable label.
    pub label: String,

    /// IDs of the tags attached to this test.
    #[serde(default)]
    pub tags: Vec<SmolStr>,

    /// True if the controller is busy discovering this test.
    #[serde(default)]
    pub busy: bool,

    /// The document the test is defined in, if known.
    #[serde(default)]
    pub uri: Option<String>,

    /// The range of the test within `uri`, if known.
    #[serde(default)]
    pub range: Option<Range>,

    /// Additional description shown next to the label.
    #[serde(default)]
    pub description: Option<String>,

    /// An error raised while discovering the test.
    #[serde(default)]
    pub error: Option<String>,
}

impl TestItem {
    /// Creates a test item with only an ID and a label.
    pub fn new(ext_id: impl Into<SmolStr>, label: impl Into<String>) -> Self {
        Self {
            ext_id: ext_id.into(),
            label: label.into(),
            tags: Vec::new(),
            busy: false,
            uri: None,
            range: None,
            description: None,
            error: None,
        }
    }

    /// Applies a shallow patch to this item.
    pub fn apply_patch(&mut self, patch: &TestItemPatch) {
        if let Some(label) = &patch.label {
            self.label.clone_from(label);
        }
        if let Some(tags) = &patch.tags {
            self.tags.clone_from(tags);
        }
        if let Some(busy) = patch.busy {
            self.busy = busy;
        }
        if let Some(uri) = &patch.uri {
            self.uri.clone_from(uri);
        }
        if let Some(range) = patch.range {
            self.range = range;
        }
        if let Some(description) = &patch.description {
            self.description.clone_from(description);
        }
        if let Some(error) = &patch.error {
            self.error.clone_from(error);
        }
    }
}

/// How far a test's children have been materialized.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestItemExpandState {
    /// The test has no children and never will.
    #[default]
    NotExpandable,

    /// The test may have children that have not been discovered yet.
    Expandable,

    /// The controller is currently discovering children.
    BusyExpanding,

    /// All children have been discovered.
    Expanded,
}

/// A [`TestItem`] plus the bookkeeping the mirror needs to place it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InternalTestItem {
    /// The controller the test came from.
    pub controller_id: SmolStr,

    /// Expand state.
    pub expand: TestItemExpandState,

    /// The parent's composite ID, or `None` for a root.
    pub parent: Option<SmolStr>,

    /// The test's own properties.
    pub item: TestItem,
}

impl InternalTestItem {
    /// Returns the test's composite ID.
    pub fn id(&self) -> &SmolStr {
        &self.item.ext_id
    }

    /// Applies a partial update.
    pub fn apply_update(&mut self, update: &TestItemUpdate) {
        if let Some(expand) = update.expand {
            self.expand = expand;
        }
        if let Some(patch) = &update.item {
            self.item.apply_patch(patch);
        }
    }
}

/// A shallow patch over the fields of a [`TestItem`]. Each `Some` field
/// replaces the existing value; for nullable fields, `Some(None)` clears it.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestItemPatch {
    /// New label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// New tag list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<SmolStr>>,
    /// New busy flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub busy: Option<bool>,
    /// New document URI.
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub uri: Option<Option<String>>,
    /// New source range.
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub range: Option<Option<Range>>,
    /// New description.
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<Option<String>>,
    /// New discovery error.
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<Option<String>>,
}

/// A partial update to an existing test in the mirror.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestItemUpdate {
    /// The composite ID of the test to update.
    pub ext_id: SmolStr,

    /// The new expand state, if it changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expand: Option<TestItemExpandState>,

    /// Changed item fields, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<TestItemPatch>,
}

impl TestItemUpdate {
    /// Creates an update that changes nothing.
    pub fn new(ext_id: impl Into<SmolStr>) -> Self {
        Self {
            ext_id: ext_id.into(),
            expand: None,
            item: None,
        }
    }

    /// Sets the new expand state.
    pub fn with_expand(mut self, expand: TestItemExpandState) -> Self {
        self.expand = Some(expand);
        self
    }

    /// Sets the item patch.
    pub fn with_item(mut self, patch: TestItemPatch) -> Self {
        self.item = Some(patch);
        self
    }
}

/// Display information for a test tag.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestTagDisplayInfo {
    /// The tag ID.
    pub id: SmolStr,

    /// The label of the controller that declared the tag.
    pub ctrl_label: String,
}

/// One instruction for mutating the test tree mirror.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "kebab-case")]
pub enum TestsDiffOp {
    /// Adds a test. Non-root tests are only added if their parent exists.
    Add(InternalTestItem),

    /// Shallow-updates an existing test.
    Update(TestItemUpdate),

    /// Removes a test and all of its descendants.
    Remove(SmolStr),

    /// Marks previous results for a test as stale.
    Retire(SmolStr),

    /// Changes the number of controllers that are yet to publish their roots.
    IncrementPendingRoots(i64),

    /// Registers a test tag.
    AddTag(TestTagDisplayInfo),

    /// Unregisters a test tag.
    RemoveTag(SmolStr),
}

/// A batch of diff operations, applied in order.
pub type TestsDiff = Vec<TestsDiffOp>;

// Distinguishes "field absent" (outer None, via `default`) from "field null"
// (Some(None)).
pub(crate) fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn patch_clears_nullable_fields() {
        let mut item = TestItem::new("ctrl\0a", "a");
        item.description = Some("desc".to_owned());
        item.error = Some("boom".to_owned());

        item.apply_patch(&TestItemPatch {
            label: Some("renamed".to_owned()),
            description: Some(None),
            ..Default::default()
        });

        assert_eq!(item.label, "renamed");
        assert_eq!(item.description, None);
        assert_eq!(item.error.as_deref(), Some("boom"), "absent field is kept");
    }

    #[test]
    fn update_patch_json_distinguishes_null_from_absent() {
        let update: TestItemUpdate = serde_json::from_str(
            r#"{ "ext-id": "ctrl\u0000a", "item": { "description": null, "label": "x" } }"#,
        )
        .unwrap();
        let patch = update.item.unwrap();
        assert_eq!(patch.description, Some(None));
        assert_eq!(patch.error, None);
        assert_eq!(patch.label.as_deref(), Some("x"));
    }

    #[test]
    fn diff_op_wire_format() {
        let op: TestsDiffOp =
            serde_json::from_str(r#"{ "op": "increment-pending-roots", "value": -1 }"#).unwrap();
        assert_eq!(op, TestsDiffOp::IncrementPendingRoots(-1));

        let op: TestsDiffOp = serde_json::from_str(
            r#"{
                "op": "add",
                "value": {
                    "controller-id": "ctrl",
                    "expand": "expandable",
                    "parent": null,
                    "item": { "ext-id": "ctrl", "label": "Root" }
                }
            }"#,
        )
        .unwrap();
        let TestsDiffOp::Add(item) = op else {
            panic!("expected add op");
        };
        assert_eq!(item.expand, TestItemExpandState::Expandable);
        assert_eq!(item.item.tags, Vec::<SmolStr>::new());
    }
}
