// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::RunId;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

bitflags! {
    /// Capability groups of a run profile.
    ///
    /// The first three bits describe what a profile does. The remaining bits
    /// only appear in capability summaries returned by the profile registry.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
    pub struct ProfileGroup: u32 {
        /// Runs tests.
        const RUN = 1 << 1;
        /// Runs tests under a debugger.
        const DEBUG = 1 << 2;
        /// Runs tests collecting coverage.
        const COVERAGE = 1 << 3;
        /// At least one usable profile is not a default.
        const HAS_NON_DEFAULT_PROFILE = 1 << 4;
        /// At least one usable profile can be configured.
        const HAS_CONFIGURABLE = 1 << 5;
    }
}

impl ProfileGroup {
    /// The groups a profile can belong to, in display order.
    pub const RUNNABLE: [Self; 3] = [Self::RUN, Self::DEBUG, Self::COVERAGE];
}

/// A way a controller can execute its tests.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestRunProfile {
    /// The controller that owns the profile.
    pub controller_id: SmolStr,

    /// The profile ID, unique within the controller.
    pub profile_id: u32,

    /// Human-readable label.
    pub label: String,

    /// The capability group.
    pub group: ProfileGroup,

    /// True if this is a default profile for its group.
    pub is_default: bool,

    /// If set, only tests carrying this tag (and controller roots) may be run
    /// with this profile.
    #[serde(default)]
    pub tag: Option<SmolStr>,

    /// True if the controller can open configuration UI for this profile.
    #[serde(default)]
    pub has_configuration_handler: bool,
}

/// A partial update to a [`TestRunProfile`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestRunProfileUpdate {
    /// New label.
    #[serde(default)]
    pub label: Option<String>,

    /// New capability group.
    #[serde(default)]
    pub group: Option<ProfileGroup>,

    /// New default flag.
    #[serde(default)]
    pub is_default: Option<bool>,

    /// New tag filter. `Some(None)` removes the filter.
    #[serde(default, deserialize_with = "crate::collection::double_option")]
    pub tag: Option<Option<SmolStr>>,

    /// New configuration handler flag.
    #[serde(default)]
    pub has_configuration_handler: Option<bool>,
}

impl TestRunProfile {
    /// Applies a partial update.
    pub fn apply_update(&mut self, update: &TestRunProfileUpdate) {
        if let Some(label) = &update.label {
            self.label.clone_from(label);
        }
        if let Some(group) = update.group {
            self.group = group;
        }
        if let Some(is_default) = update.is_default {
            self.is_default = is_default;
        }
        if let Some(tag) = &update.tag {
            self.tag.clone_from(tag);
        }
        if let Some(has_configuration_handler) = update.has_configuration_handler {
            self.has_configuration_handler = has_configuration_handler;
        }
    }
}

/// One per-controller slice of a resolved run request.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResolvedRunTarget {
    /// The controller to dispatch to.
    pub controller_id: SmolStr,

    /// The profile to run with.
    pub profile_id: u32,

    /// The group of that profile.
    pub profile_group: ProfileGroup,

    /// Composite IDs of the tests to run.
    pub test_ids: Vec<SmolStr>,
}

/// A run request with a concrete profile chosen for every test.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResolvedTestRunRequest {
    /// Per-controller targets.
    pub targets: Vec<ResolvedRunTarget>,

    /// Composite IDs of tests to exclude from every target.
    #[serde(default)]
    pub exclude: Option<Vec<SmolStr>>,

    /// True if the run was triggered automatically.
    #[serde(default)]
    pub is_auto_run: bool,
}

/// The request a single controller receives for its share of a run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunTestForControllerRequest {
    /// The run this request belongs to.
    pub run_id: RunId,

    /// The controller being asked to run tests.
    pub controller_id: SmolStr,

    /// The profile to run with.
    pub profile_id: u32,

    /// Composite IDs of tests to exclude.
    pub exclude_ext_ids: Vec<SmolStr>,

    /// Composite IDs of tests to run.
    pub test_ids: Vec<SmolStr>,
}
