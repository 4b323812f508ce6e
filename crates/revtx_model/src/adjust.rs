//! Reference adjustment after ID reassignment.

use crate::id::ObjectId;
use std::collections::HashMap;

/// Rewrites object references, typically temporary IDs to permanent ones.
pub trait ReferenceAdjuster {
    /// Returns the ID that should replace `id`.
    fn adjust(&self, id: ObjectId) -> ObjectId;
}

/// A [`ReferenceAdjuster`] backed by an explicit ID mapping.
///
/// IDs without a mapping are returned unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMapper {
    mappings: HashMap<ObjectId, ObjectId>,
}

impl IdMapper {
    /// Creates an empty mapper.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mapper from existing mappings.
    #[must_use]
    pub fn from_mappings(mappings: HashMap<ObjectId, ObjectId>) -> Self {
        Self { mappings }
    }

    /// Adds a mapping.
    pub fn insert(&mut self, from: ObjectId, to: ObjectId) {
        self.mappings.insert(from, to);
    }

    /// Returns the mapping for `from`, if any.
    #[must_use]
    pub fn get(&self, from: ObjectId) -> Option<ObjectId> {
        self.mappings.get(&from).copied()
    }

    /// Returns all mappings.
    #[must_use]
    pub fn mappings(&self) -> &HashMap<ObjectId, ObjectId> {
        &self.mappings
    }

    /// Returns true if there are no mappings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

impl ReferenceAdjuster for IdMapper {
    fn adjust(&self, id: ObjectId) -> ObjectId {
        self.get(id).unwrap_or(id)
    }
}

impl ReferenceAdjuster for HashMap<ObjectId, ObjectId> {
    fn adjust(&self, id: ObjectId) -> ObjectId {
        self.get(&id).copied().unwrap_or(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_ids_pass_through() {
        let mut mapper = IdMapper::new();
        assert!(mapper.is_empty());
        mapper.insert(ObjectId::temp(1), ObjectId::permanent(77));

        assert_eq!(mapper.adjust(ObjectId::temp(1)), ObjectId::permanent(77));
        assert_eq!(mapper.adjust(ObjectId::temp(2)), ObjectId::temp(2));
        assert_eq!(mapper.get(ObjectId::temp(2)), None);
    }
}
