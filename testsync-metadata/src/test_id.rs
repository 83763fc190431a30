// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Composite test IDs.
//!
//! Every test in the mirror is addressed by a single string encoding the
//! controller that owns it and the path of local IDs from the controller root
//! down to the test. Segments are joined with a NUL byte, which controllers
//! may not use inside their own IDs. The first segment is the controller ID,
//! which doubles as the ID of the controller's root test.

use crate::errors::TestIdParseError;
use smol_str::SmolStr;
use std::{fmt, str::FromStr};

/// The delimiter between path segments of a composite test ID.
pub const TEST_ID_DELIMITER: char = '\0';

/// The relationship between two composite test IDs, as returned by
/// [`TestId::compare`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TestPosition {
    /// The second ID is a descendant of the first.
    IsChild,

    /// The second ID is an ancestor of the first.
    IsParent,

    /// The IDs are identical.
    IsSame,

    /// Neither ID is an ancestor of the other.
    Disconnected,
}

/// A parsed composite test ID.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TestId {
    path: Vec<SmolStr>,
}

impl TestId {
    /// Creates a test ID from a root-to-leaf path. The first segment is the
    /// controller ID.
    pub fn new<I, S>(path: I) -> Result<Self, TestIdParseError>
    where
        I: IntoIterator<Item = S>,
        S: Into<SmolStr>,
    {
        let path: Vec<SmolStr> = path.into_iter().map(Into::into).collect();
        if path.is_empty() || path[0].is_empty() {
            return Err(TestIdParseError::Empty);
        }
        if let Some(segment) = path.iter().find(|s| s.contains(TEST_ID_DELIMITER)) {
            return Err(TestIdParseError::DelimiterInSegment {
                segment: segment.to_string(),
            });
        }
        Ok(Self { path })
    }

    /// Returns the ID of a controller's root test.
    pub fn root(controller_id: &str) -> Result<Self, TestIdParseError> {
        Self::new([controller_id])
    }

    /// Parses a composite test ID string.
    pub fn from_string(id: &str) -> Result<Self, TestIdParseError> {
        // Splitting can't produce a segment containing the delimiter, so
        // only the controller ID needs checking.
        if id.is_empty() || id.starts_with(TEST_ID_DELIMITER) {
            return Err(TestIdParseError::Empty);
        }
        Ok(Self {
            path: id.split(TEST_ID_DELIMITER).map(SmolStr::new).collect(),
        })
    }

    /// Returns a new ID for a child of this test.
    pub fn join(&self, local_id: &str) -> Result<Self, TestIdParseError> {
        if local_id.contains(TEST_ID_DELIMITER) {
            return Err(TestIdParseError::DelimiterInSegment {
                segment: local_id.to_owned(),
            });
        }
        let mut path = self.path.clone();
        path.push(local_id.into());
        Ok(Self { path })
    }

    /// Returns true if the composite ID string names a controller root.
    pub fn is_root_id(id: &str) -> bool {
        !id.contains(TEST_ID_DELIMITER)
    }

    /// Returns true if `maybe_child` is a descendant (at any depth) of
    /// `maybe_parent`. Both are composite ID strings.
    pub fn is_child(maybe_parent: &str, maybe_child: &str) -> bool {
        maybe_child
            .strip_prefix(maybe_parent)
            .is_some_and(|rest| rest.starts_with(TEST_ID_DELIMITER))
    }

    /// Compares the position of `b` relative to `a`.
    pub fn compare(a: &str, b: &str) -> TestPosition {
        if a == b {
            TestPosition::IsSame
        } else if Self::is_child(a, b) {
            TestPosition::IsChild
        } else if Self::is_child(b, a) {
            TestPosition::IsParent
        } else {
            TestPosition::Disconnected
        }
    }

    /// Recovers the controller ID from a composite ID string without
    /// allocating.
    pub fn controller_id_of(id: &str) -> &str {
        id.split(TEST_ID_DELIMITER).next().unwrap_or(id)
    }

    /// Returns the ID of the controller that owns this test.
    pub fn controller_id(&self) -> &str {
        &self.path[0]
    }

    /// Returns true if this is a controller root.
    pub fn is_root(&self) -> bool {
        self.path.len() == 1
    }

    /// Returns the ID of the controller root above this test.
    pub fn root_id(&self) -> TestId {
        Self {
            path: self.path[..1].to_vec(),
        }
    }

    /// Returns the ID of this test's parent, or `None` for a root.
    pub fn parent_id(&self) -> Option<TestId> {
        (!self.is_root()).then(|| Self {
            path: self.path[..self.path.len() - 1].to_vec(),
        })
    }

    /// Returns the last path segment: the controller-assigned local ID.
    pub fn local_id(&self) -> &str {
        &self.path[self.path.len() - 1]
    }

    /// Returns the path segments from the root down.
    pub fn path(&self) -> &[SmolStr] {
        &self.path
    }

    /// Iterates over the IDs of this test and each of its ancestors, root
    /// first.
    pub fn ids_from_root(&self) -> impl Iterator<Item = TestId> + '_ {
        (1..=self.path.len()).map(|len| Self {
            path: self.path[..len].to_vec(),
        })
    }

    /// Iterates over the IDs of this test and each of its ancestors, this test
    /// first.
    pub fn ids_to_root(&self) -> impl Iterator<Item = TestId> + '_ {
        (1..=self.path.len()).rev().map(|len| Self {
            path: self.path[..len].to_vec(),
        })
    }
}

impl FromStr for TestId {
    type Err = TestIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_string(s)
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.path.iter().enumerate() {
            if i > 0 {
                write!(f, "{TEST_ID_DELIMITER}")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl From<&TestId> for SmolStr {
    fn from(id: &TestId) -> Self {
        SmolStr::new(id.to_string())
    }
}
