//! The ordered chain of savepoints.

use crate::error::{CoreError, CoreResult};
use crate::types::{SavepointId, TransactionId};

/// Handle to one savepoint of a transaction.
///
/// Handles stay valid until a rollback or commit discards the savepoint;
/// using a discarded handle fails with [`CoreError::InvalidSavepoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SavepointHandle {
    transaction: TransactionId,
    id: SavepointId,
}

impl SavepointHandle {
    /// Transaction that owns the savepoint.
    #[must_use]
    pub const fn transaction(&self) -> TransactionId {
        self.transaction
    }

    /// Savepoint identity.
    #[must_use]
    pub const fn id(&self) -> SavepointId {
        self.id
    }
}

#[derive(Debug, Clone)]
struct Savepoint<T> {
    id: SavepointId,
    log: T,
}

/// Savepoints of one transaction, first to last.
///
/// The payload `T` is what each savepoint records: a
/// [`ChangeLog`](super::ChangeLog) for a single transaction, or the
/// participants' own savepoints for an XA transaction. Edits always go into
/// the last savepoint.
#[derive(Debug, Clone)]
pub struct SavepointChain<T> {
    owner: TransactionId,
    savepoints: Vec<Savepoint<T>>,
    next_id: u64,
}

impl<T: Default> SavepointChain<T> {
    /// Creates a chain holding only the first savepoint.
    #[must_use]
    pub fn new(owner: TransactionId) -> Self {
        Self {
            owner,
            savepoints: vec![Savepoint {
                id: SavepointId::new(1),
                log: T::default(),
            }],
            next_id: 2,
        }
    }

    /// Transaction owning the chain.
    #[must_use]
    pub fn owner(&self) -> TransactionId {
        self.owner
    }

    /// Appends a savepoint after the current last one and returns its handle.
    pub fn push(&mut self) -> SavepointHandle {
        let id = self.allocate_id();
        self.savepoints.push(Savepoint {
            id,
            log: T::default(),
        });
        self.handle(id)
    }

    /// Number of savepoints on the chain; never zero.
    #[must_use]
    pub fn len(&self) -> usize {
        self.savepoints.len()
    }

    /// Always false; a chain has at least its first savepoint.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.savepoints.is_empty()
    }

    /// Handle of the first savepoint.
    #[must_use]
    pub fn first_handle(&self) -> SavepointHandle {
        self.handle(self.savepoints[0].id)
    }

    /// Handle of the last savepoint.
    #[must_use]
    pub fn last_handle(&self) -> SavepointHandle {
        self.handle(self.savepoints[self.savepoints.len() - 1].id)
    }

    /// Handles of every savepoint, first to last.
    #[must_use]
    pub fn handles(&self) -> Vec<SavepointHandle> {
        self.savepoints.iter().map(|s| self.handle(s.id)).collect()
    }

    /// Payload of the first savepoint.
    #[must_use]
    pub fn first(&self) -> &T {
        &self.savepoints[0].log
    }

    /// Payload of the last savepoint.
    #[must_use]
    pub fn last(&self) -> &T {
        &self.savepoints[self.savepoints.len() - 1].log
    }

    /// Mutable payload of the last savepoint.
    pub fn last_mut(&mut self) -> &mut T {
        let last = self.savepoints.len() - 1;
        &mut self.savepoints[last].log
    }

    /// Payload at `index` (0 is the first savepoint).
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.savepoints.get(index).map(|s| &s.log)
    }

    /// Mutable payload at `index`.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.savepoints.get_mut(index).map(|s| &mut s.log)
    }

    /// Payloads first to last.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.savepoints.iter().map(|s| &s.log)
    }

    /// Payloads first to last, mutably.
    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut T> + ExactSizeIterator {
        self.savepoints.iter_mut().map(|s| &mut s.log)
    }

    /// Returns the index of `handle` on the chain.
    ///
    /// Fails with [`CoreError::ForeignSavepoint`] for a handle of another
    /// transaction and [`CoreError::InvalidSavepoint`] for a discarded one.
    pub fn position(&self, handle: SavepointHandle) -> CoreResult<usize> {
        if handle.transaction != self.owner {
            return Err(CoreError::ForeignSavepoint {
                owner: handle.transaction,
                transaction: self.owner,
            });
        }
        self.savepoints
            .iter()
            .position(|s| s.id == handle.id)
            .ok_or_else(|| {
                CoreError::invalid_savepoint(format!(
                    "{} is not on the chain of {}",
                    handle.id, self.owner
                ))
            })
    }

    /// Returns true if `handle` is on this chain.
    #[must_use]
    pub fn contains(&self, handle: SavepointHandle) -> bool {
        self.position(handle).is_ok()
    }

    /// Discards every savepoint after `index`.
    pub fn truncate_after(&mut self, index: usize) {
        self.savepoints.truncate(index + 1);
    }

    /// Replaces the chain by a single fresh savepoint.
    ///
    /// The new first savepoint gets a new ID, so every earlier handle
    /// becomes invalid.
    pub fn reset(&mut self) {
        let id = self.allocate_id();
        self.savepoints.clear();
        self.savepoints.push(Savepoint {
            id,
            log: T::default(),
        });
    }

    fn allocate_id(&mut self) -> SavepointId {
        let id = SavepointId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn handle(&self, id: SavepointId) -> SavepointHandle {
        SavepointHandle {
            transaction: self.owner,
            id,
        }
    }
}
