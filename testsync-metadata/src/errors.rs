// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

/// An error that occurs while constructing or parsing a [`TestId`](crate::TestId).
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum TestIdParseError {
    /// The input was empty, so no controller ID could be recovered.
    #[error("test ID is empty")]
    Empty,

    /// A path segment contained the reserved NUL delimiter.
    #[error("test ID segment `{}` contains the reserved delimiter", .segment.escape_debug())]
    DelimiterInSegment {
        /// The offending segment.
        segment: String,
    },
}
