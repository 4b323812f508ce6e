//! Change-set aggregates.

use crate::delta::RevisionDelta;
use crate::id::ObjectId;
use crate::revision::Revision;
use crate::types::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An object ID paired with the version it had when it was detached.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct IdAndVersion {
    /// Object identity.
    pub id: ObjectId,
    /// Version at detachment; [`Version::UNSPECIFIED`] if unknown.
    pub version: Version,
}

impl IdAndVersion {
    /// Creates a pair.
    #[must_use]
    pub const fn new(id: ObjectId, version: Version) -> Self {
        Self { id, version }
    }
}

/// New objects, changed objects and detached objects of one unit of work.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetData {
    /// Full revisions of created objects.
    pub new_objects: Vec<Revision>,
    /// Deltas of modified objects.
    pub changed_objects: Vec<RevisionDelta>,
    /// Removed objects.
    pub detached_objects: Vec<IdAndVersion>,
}

impl ChangeSetData {
    /// Creates a change set.
    #[must_use]
    pub fn new(
        new_objects: Vec<Revision>,
        changed_objects: Vec<RevisionDelta>,
        detached_objects: Vec<IdAndVersion>,
    ) -> Self {
        Self {
            new_objects,
            changed_objects,
            detached_objects,
        }
    }

    /// Returns true if the change set carries nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new_objects.is_empty()
            && self.changed_objects.is_empty()
            && self.detached_objects.is_empty()
    }

    /// Returns the number of touched objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.new_objects.len() + self.changed_objects.len() + self.detached_objects.len()
    }
}

/// Source of revisions by ID, e.g. the state before or after a change set.
pub trait RevisionProvider {
    /// Returns the revision of `id`, if known.
    fn revision(&self, id: ObjectId) -> Option<Revision>;
}

impl RevisionProvider for HashMap<ObjectId, Revision> {
    fn revision(&self, id: ObjectId) -> Option<Revision> {
        self.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BranchId;

    #[test]
    fn empty_change_set() {
        let data = ChangeSetData::default();
        assert!(data.is_empty());
        assert_eq!(data.len(), 0);
    }

    #[test]
    fn counts_all_parts() {
        let data = ChangeSetData::new(
            Vec::new(),
            vec![RevisionDelta::new(
                ObjectId::permanent(1),
                BranchId::MAIN,
                Version::FIRST,
            )],
            vec![IdAndVersion::new(ObjectId::permanent(2), Version::FIRST)],
        );
        assert!(!data.is_empty());
        assert_eq!(data.len(), 2);
    }
}
