// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use newtype_uuid::{TypedUuid, TypedUuidKind, TypedUuidTag};

/// Marker type for [`RunId`].
pub enum RunKind {}

impl TypedUuidKind for RunKind {
    #[inline]
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("run");
        TAG
    }
}

/// The unique ID of a test run.
pub type RunId = TypedUuid<RunKind>;
