//! Scalar coordinates used throughout the model.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-object, per-branch revision number.
///
/// Versions increase monotonically as an object is committed on a branch.
/// [`Version::UNSPECIFIED`] marks a revision that was never committed.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug, Serialize, Deserialize,
)]
pub struct Version(pub u32);

impl Version {
    /// Version of a revision that has not been committed yet.
    pub const UNSPECIFIED: Self = Self(0);

    /// Version assigned by the first commit of an object.
    pub const FIRST: Self = Self(1);

    /// Creates a version.
    #[inline]
    #[must_use]
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns true unless this is [`Version::UNSPECIFIED`].
    #[inline]
    #[must_use]
    pub const fn is_specified(&self) -> bool {
        self.0 != 0
    }

    /// Returns the version a successful commit produces.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Milliseconds since the Unix epoch, as issued by the repository.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug, Serialize, Deserialize,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// A point in time that has not been fixed yet ("head").
    pub const UNSPECIFIED: Self = Self(0);

    /// Creates a timestamp.
    #[inline]
    #[must_use]
    pub const fn new(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the raw milliseconds.
    #[inline]
    #[must_use]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Returns true unless this is [`Timestamp::UNSPECIFIED`].
    #[inline]
    #[must_use]
    pub const fn is_specified(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_specified() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("HEAD")
        }
    }
}

/// Identifier of a branch in the repository's branch tree.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug, Serialize, Deserialize,
)]
pub struct BranchId(pub u32);

impl BranchId {
    /// The root branch every repository starts with.
    pub const MAIN: Self = Self(0);

    /// Creates a branch ID.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "branch:{}", self.0)
    }
}
