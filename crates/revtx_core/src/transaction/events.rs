//! Transaction events, listeners and handlers.

use super::state::TransactionState;
use super::Transaction;
use crate::error::CoreResult;
use crate::object::ManagedObject;
use revtx_model::{FeatureValue, ObjectId, Revision};
use revtx_protocol::CommitInfo;
use std::collections::HashMap;

/// How a unit of work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishKind {
    /// The pending changes were committed.
    Committed,
    /// The pending changes were rolled back.
    RolledBack,
}

/// Before and after image of one object touched by a batch update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectChange {
    /// Affected object.
    pub id: ObjectId,
    /// Revision before the update; `None` for an object that appeared.
    pub old: Option<Revision>,
    /// Revision after the update; `None` for an object that went away.
    pub new: Option<Revision>,
}

/// Something observable that happened to a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEvent {
    /// The transaction became dirty.
    Started,
    /// A commit or rollback completed.
    Finished {
        /// Commit or rollback.
        kind: FinishKind,
        /// Temporary to permanent ID mappings of a commit; empty otherwise.
        id_mappings: HashMap<ObjectId, ObjectId>,
    },
    /// An object started conflicting with a remote change.
    Conflict {
        /// Conflicting object.
        id: ObjectId,
        /// True if this is the first unresolved conflict of the transaction.
        first: bool,
    },
    /// A batch update (change-set merge, remote invalidation) touched objects.
    ObjectsChanged(Vec<ObjectChange>),
}

/// Receives transaction events after the transaction lock is released.
pub trait TransactionListener: Send + Sync {
    /// Called once per event, in the order the events were raised.
    fn on_event(&self, transaction: &Transaction, event: &TransactionEvent);
}

impl<F> TransactionListener for F
where
    F: Fn(&Transaction, &TransactionEvent) + Send + Sync,
{
    fn on_event(&self, transaction: &Transaction, event: &TransactionEvent) {
        self(transaction, event);
    }
}

/// Hooks into the commit and rollback of a transaction.
///
/// `committing` runs under the transaction lock and may still edit objects
/// through the [`ObjectEditor`]; an error aborts the commit. Errors from
/// `committed` and `rolled_back` are logged and otherwise ignored.
pub trait TransactionHandler: Send + Sync {
    /// Called before the commit payload is built.
    fn committing(&self, editor: &mut ObjectEditor<'_>) -> CoreResult<()> {
        let _ = editor;
        Ok(())
    }

    /// Called after a successful commit.
    fn committed(&self, transaction: &Transaction, info: &CommitInfo) -> CoreResult<()> {
        let _ = (transaction, info);
        Ok(())
    }

    /// Called after a rollback.
    fn rolled_back(&self, transaction: &Transaction) -> CoreResult<()> {
        let _ = transaction;
        Ok(())
    }
}

/// Edit access handed to [`TransactionHandler::committing`].
pub struct ObjectEditor<'a> {
    state: &'a mut TransactionState,
    modified: bool,
}

impl<'a> ObjectEditor<'a> {
    pub(crate) fn new(state: &'a mut TransactionState) -> Self {
        Self {
            state,
            modified: false,
        }
    }

    /// IDs of the new and dirty objects about to be committed.
    pub fn committing_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<_> = self.state.chain.all_new_objects().into_iter().collect();
        ids.extend(self.state.chain.all_dirty_objects());
        ids
    }

    /// Looks up a live object.
    pub fn object(&self, id: ObjectId) -> Option<&ManagedObject> {
        self.state.objects.live(id)
    }

    /// Sets a single-valued feature.
    pub fn set(&mut self, id: ObjectId, feature: &str, value: FeatureValue) -> CoreResult<()> {
        self.state.set_value(id, feature, value)?;
        self.modified = true;
        Ok(())
    }

    /// Unsets a feature.
    pub fn unset(&mut self, id: ObjectId, feature: &str) -> CoreResult<()> {
        self.state.unset_value(id, feature)?;
        self.modified = true;
        Ok(())
    }

    /// Appends to a many-valued feature.
    pub fn push(&mut self, id: ObjectId, feature: &str, value: FeatureValue) -> CoreResult<()> {
        let index = self.state.objects.require_live(id)?.revision.size(feature)?;
        self.state.add_value(id, feature, index, value)?;
        self.modified = true;
        Ok(())
    }

    /// Returns true if any edit went through this editor.
    pub fn modified(&self) -> bool {
        self.modified
    }
}
