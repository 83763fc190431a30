// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run profiles, per controller.

use indexmap::IndexMap;
use smol_str::SmolStr;
use testsync_metadata::{
    InternalTestItem, ProfileGroup, TestId, TestRunProfile, TestRunProfileUpdate,
};

/// Returns true if `profile` may be used to run `test`.
///
/// The profile must belong to the test's controller. Controller roots can be
/// run with any of the controller's profiles; other tests must carry the
/// profile's tag, if it has one.
pub fn can_use_profile_with_test(profile: &TestRunProfile, test: &InternalTestItem) -> bool {
    profile.controller_id == test.controller_id
        && (TestId::is_root_id(test.id())
            || profile
                .tag
                .as_ref()
                .is_none_or(|tag| test.item.tags.contains(tag)))
}

/// The run profiles of every registered controller.
///
/// Each controller's profiles are kept sorted with defaults first, then by
/// label.
#[derive(Clone, Debug, Default)]
pub struct TestProfileRegistry {
    controllers: IndexMap<SmolStr, Vec<TestRunProfile>>,
}

impl TestProfileRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a profile to its controller's list. A profile with the same ID
    /// is replaced.
    pub fn add_profile(&mut self, profile: TestRunProfile) {
        let profiles = self
            .controllers
            .entry(profile.controller_id.clone())
            .or_default();
        profiles.retain(|p| p.profile_id != profile.profile_id);
        profiles.push(profile);
        sort_profiles(profiles);
    }

    /// Applies an update to an existing profile. Returns false if the profile
    /// is unknown.
    pub fn update_profile(
        &mut self,
        controller_id: &str,
        profile_id: u32,
        update: &TestRunProfileUpdate,
    ) -> bool {
        let Some(profiles) = self.controllers.get_mut(controller_id) else {
            return false;
        };
        let Some(profile) = profiles.iter_mut().find(|p| p.profile_id == profile_id) else {
            return false;
        };
        profile.apply_update(update);
        sort_profiles(profiles);
        true
    }

    /// Removes one profile, or every profile of the controller if
    /// `profile_id` is `None`.
    pub fn remove_profile(&mut self, controller_id: &str, profile_id: Option<u32>) {
        match profile_id {
            None => {
                self.controllers.shift_remove(controller_id);
            }
            Some(profile_id) => {
                if let Some(profiles) = self.controllers.get_mut(controller_id) {
                    profiles.retain(|p| p.profile_id != profile_id);
                }
            }
        }
    }

    /// Returns every profile of a controller.
    pub fn get_controller_profiles(&self, controller_id: &str) -> &[TestRunProfile] {
        self.controllers
            .get(controller_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Returns a controller's profiles in `group`, defaults first.
    pub fn get_controller_group_profiles<'a>(
        &'a self,
        controller_id: &str,
        group: ProfileGroup,
    ) -> impl Iterator<Item = &'a TestRunProfile> + 'a {
        self.get_controller_profiles(controller_id)
            .iter()
            .filter(move |p| p.group.intersects(group))
    }

    /// Looks up a single profile.
    pub fn get_profile(&self, controller_id: &str, profile_id: u32) -> Option<&TestRunProfile> {
        self.get_controller_profiles(controller_id)
            .iter()
            .find(|p| p.profile_id == profile_id)
    }

    /// Returns, for each controller, its first profile in `group`.
    ///
    /// Since defaults sort first, this is the controller's default profile for
    /// the group if it has one.
    pub fn get_base_defaults_profile(&self, group: ProfileGroup) -> Vec<&TestRunProfile> {
        self.controllers
            .values()
            .filter_map(|profiles| profiles.iter().find(|p| p.group.intersects(group)))
            .collect()
    }

    /// Returns the groups `test` can be run in, plus
    /// [`ProfileGroup::HAS_NON_DEFAULT_PROFILE`] if more than one profile is
    /// usable for a group and [`ProfileGroup::HAS_CONFIGURABLE`] if any usable
    /// profile has a configuration handler.
    pub fn capabilities_for_test(&self, test: &InternalTestItem) -> ProfileGroup {
        let mut capabilities = ProfileGroup::empty();
        for profile in self
            .get_controller_profiles(&test.controller_id)
            .iter()
            .filter(|p| can_use_profile_with_test(p, test))
        {
            if capabilities.intersects(profile.group) {
                capabilities |= ProfileGroup::HAS_NON_DEFAULT_PROFILE;
            } else {
                capabilities |= profile.group;
            }
            if profile.has_configuration_handler {
                capabilities |= ProfileGroup::HAS_CONFIGURABLE;
            }
        }
        capabilities
    }

    /// Iterates over every profile of every controller.
    pub fn all(&self) -> impl Iterator<Item = &TestRunProfile> + '_ {
        self.controllers.values().flatten()
    }
}

fn sort_profiles(profiles: &mut [TestRunProfile]) {
    profiles.sort_by(|a, b| {
        b.is_default
            .cmp(&a.is_default)
            .then_with(|| a.label.cmp(&b.label))
    });
}
