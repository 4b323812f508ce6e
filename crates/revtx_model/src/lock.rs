//! Object lock states.

use crate::adjust::ReferenceAdjuster;
use crate::id::ObjectId;
use crate::types::BranchId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Kind of lock.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum LockType {
    /// Shared lock; many owners.
    Read,
    /// Exclusive lock.
    Write,
    /// Reservation of the right to take the write lock later.
    WriteOption,
}

/// The view that owns a lock.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct LockOwner {
    /// Owning session.
    pub session_id: u32,
    /// Owning view within the session.
    pub view_id: u32,
    /// Durable locking area, if the lock survives the session.
    pub durable_locking_id: Option<String>,
}

impl LockOwner {
    /// Creates a non-durable owner.
    #[must_use]
    pub const fn new(session_id: u32, view_id: u32) -> Self {
        Self {
            session_id,
            view_id,
            durable_locking_id: None,
        }
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.view_id)
    }
}

/// What a lock is keyed by.
///
/// Repositories that support branching lock `(object, branch)` pairs; the
/// others lock plain object IDs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum LockTarget {
    /// Plain object key.
    Object(ObjectId),
    /// Object on a specific branch.
    Branched {
        /// Object identity.
        id: ObjectId,
        /// Branch.
        branch: BranchId,
    },
}

impl LockTarget {
    /// Creates the right key kind for a repository.
    #[must_use]
    pub const fn for_object(id: ObjectId, branch: BranchId, supports_branching: bool) -> Self {
        if supports_branching {
            Self::Branched { id, branch }
        } else {
            Self::Object(id)
        }
    }

    /// The locked object.
    #[must_use]
    pub const fn id(&self) -> ObjectId {
        match self {
            Self::Object(id) | Self::Branched { id, .. } => *id,
        }
    }

    fn with_id(self, id: ObjectId) -> Self {
        match self {
            Self::Object(_) => Self::Object(id),
            Self::Branched { branch, .. } => Self::Branched { id, branch },
        }
    }
}

/// Read, write and write-option ownership of one lock target.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct LockState {
    target: LockTarget,
    read_owners: BTreeSet<LockOwner>,
    write_owner: Option<LockOwner>,
    write_option_owner: Option<LockOwner>,
}

impl LockState {
    /// Creates an unlocked state.
    #[must_use]
    pub fn new(target: LockTarget) -> Self {
        Self {
            target,
            read_owners: BTreeSet::new(),
            write_owner: None,
            write_option_owner: None,
        }
    }

    /// The lock key.
    #[must_use]
    pub fn target(&self) -> LockTarget {
        self.target
    }

    /// Owners holding a read lock.
    #[must_use]
    pub fn read_owners(&self) -> &BTreeSet<LockOwner> {
        &self.read_owners
    }

    /// Owner holding the write lock.
    #[must_use]
    pub fn write_owner(&self) -> Option<&LockOwner> {
        self.write_owner.as_ref()
    }

    /// Owner holding the write option.
    #[must_use]
    pub fn write_option_owner(&self) -> Option<&LockOwner> {
        self.write_option_owner.as_ref()
    }

    /// Returns true if `owner` holds a lock of `lock_type`.
    #[must_use]
    pub fn is_locked_by(&self, lock_type: LockType, owner: &LockOwner) -> bool {
        match lock_type {
            LockType::Read => self.read_owners.contains(owner),
            LockType::Write => self.write_owner.as_ref() == Some(owner),
            LockType::WriteOption => self.write_option_owner.as_ref() == Some(owner),
        }
    }

    /// Returns true if anybody other than `owner` holds a lock of `lock_type`.
    #[must_use]
    pub fn is_locked_by_others(&self, lock_type: LockType, owner: &LockOwner) -> bool {
        match lock_type {
            LockType::Read => self.read_owners.iter().any(|o| o != owner),
            LockType::Write => self.write_owner.as_ref().is_some_and(|o| o != owner),
            LockType::WriteOption => self.write_option_owner.as_ref().is_some_and(|o| o != owner),
        }
    }

    /// Returns true if `owner` could take `lock_type` right now.
    #[must_use]
    pub fn can_lock(&self, lock_type: LockType, owner: &LockOwner) -> bool {
        match lock_type {
            LockType::Read => {
                !self.is_locked_by_others(LockType::Write, owner)
            }
            LockType::Write => {
                !self.is_locked_by_others(LockType::Read, owner)
                    && !self.is_locked_by_others(LockType::Write, owner)
                    && !self.is_locked_by_others(LockType::WriteOption, owner)
            }
            LockType::WriteOption => {
                !self.is_locked_by_others(LockType::Write, owner)
                    && !self.is_locked_by_others(LockType::WriteOption, owner)
            }
        }
    }

    /// Grants `lock_type` to `owner`; returns false if it was already held.
    pub fn add_owner(&mut self, lock_type: LockType, owner: LockOwner) -> bool {
        match lock_type {
            LockType::Read => self.read_owners.insert(owner),
            LockType::Write => self.write_owner.replace(owner.clone()) != Some(owner),
            LockType::WriteOption => self.write_option_owner.replace(owner.clone()) != Some(owner),
        }
    }

    /// Releases `lock_type` held by `owner`; returns true if it was held.
    pub fn remove_owner(&mut self, lock_type: LockType, owner: &LockOwner) -> bool {
        match lock_type {
            LockType::Read => self.read_owners.remove(owner),
            LockType::Write => take_if_owned(&mut self.write_owner, owner),
            LockType::WriteOption => take_if_owned(&mut self.write_option_owner, owner),
        }
    }

    /// Releases every lock held by `owner`.
    pub fn remove_all(&mut self, owner: &LockOwner) -> bool {
        let read = self.read_owners.remove(owner);
        let write = take_if_owned(&mut self.write_owner, owner);
        let option = take_if_owned(&mut self.write_option_owner, owner);
        read || write || option
    }

    /// Returns true if no lock is held.
    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.read_owners.is_empty() && self.write_owner.is_none() && self.write_option_owner.is_none()
    }

    /// Rewrites the locked object ID, e.g. after commit assigned a permanent one.
    pub fn adjust_target(&mut self, adjuster: &dyn ReferenceAdjuster) {
        self.target = self.target.with_id(adjuster.adjust(self.target.id()));
    }
}

fn take_if_owned(slot: &mut Option<LockOwner>, owner: &LockOwner) -> bool {
    if slot.as_ref() == Some(owner) {
        *slot = None;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjust::IdMapper;

    fn owner(view: u32) -> LockOwner {
        LockOwner::new(1, view)
    }

    #[test]
    fn write_excludes_others() {
        let mut state = LockState::new(LockTarget::Object(ObjectId::permanent(1)));
        assert!(state.add_owner(LockType::Write, owner(1)));
        assert!(!state.can_lock(LockType::Read, &owner(2)));
        assert!(!state.can_lock(LockType::Write, &owner(2)));
        assert!(state.can_lock(LockType::Read, &owner(1)));
    }

    #[test]
    fn readers_share() {
        let mut state = LockState::new(LockTarget::Object(ObjectId::permanent(1)));
        state.add_owner(LockType::Read, owner(1));
        assert!(state.can_lock(LockType::Read, &owner(2)));
        assert!(!state.can_lock(LockType::Write, &owner(2)));
        assert!(state.can_lock(LockType::WriteOption, &owner(2)));
    }

    #[test]
    fn release_all() {
        let mut state = LockState::new(LockTarget::Object(ObjectId::permanent(1)));
        state.add_owner(LockType::Read, owner(1));
        state.add_owner(LockType::WriteOption, owner(1));
        assert!(!state.remove_owner(LockType::Write, &owner(1)));
        assert!(state.remove_all(&owner(1)));
        assert!(state.is_unlocked());
    }

    #[test]
    fn target_kind_depends_on_branching() {
        let id = ObjectId::permanent(3);
        assert_eq!(
            LockTarget::for_object(id, BranchId::MAIN, false),
            LockTarget::Object(id)
        );
        assert_eq!(
            LockTarget::for_object(id, BranchId::new(2), true).id(),
            id
        );
    }

    #[test]
    fn adjust_target_after_commit() {
        let mut state = LockState::new(LockTarget::Branched {
            id: ObjectId::temp(1),
            branch: BranchId::MAIN,
        });
        let mut mapper = IdMapper::new();
        mapper.insert(ObjectId::temp(1), ObjectId::permanent(77));
        state.adjust_target(&mapper);
        assert_eq!(state.target().id(), ObjectId::permanent(77));
    }
}
