//! The client transaction.
//!
//! A [`Transaction`] is a cheap handle around shared state. Every operation
//! takes the transaction lock, runs against the mutable
//! [`TransactionState`](state::TransactionState), drains the events it
//! raised and delivers them to listeners after the lock is released.

mod apply;
mod committing;
mod conflict;
mod events;
mod io;
mod locks;
mod rollback;
pub(crate) mod state;
mod strategy;

pub use conflict::{ConflictResolver, ConflictSet, RebaseResolver, TakeRemoteResolver};
pub use events::{
    FinishKind, ObjectChange, ObjectEditor, TransactionEvent, TransactionHandler, TransactionListener,
};
pub use io::ExportOptions;
pub use strategy::{DefaultStrategy, TransactionStrategy};

use crate::commit::CommitContext;
use crate::config::TransactionConfig;
use crate::error::{CoreError, CoreResult};
use crate::object::ManagedObject;
use crate::savepoint::SavepointHandle;
use crate::types::TransactionId;
use parking_lot::{Mutex, RwLock};
use revtx_model::{
    BranchPoint, ChangeSetData, ClassInfo, FeatureValue, Lob, LockState, ObjectId, Revision,
    RevisionDelta, RevisionProvider, Timestamp,
};
use revtx_protocol::{
    with_retry, CommitInfo, ListenerId, LoadRevisionsRequest, SessionNotification, SessionProtocol,
};
use state::TransactionState;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Weak};
use tracing::{debug, info, warn};

static NEXT_TRANSACTION_ID: AtomicU32 = AtomicU32::new(1);

/// Hands out process-wide unique transaction IDs.
pub(crate) fn next_transaction_id() -> TransactionId {
    TransactionId::new(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
}

struct Shared {
    id: TransactionId,
    session: Arc<dyn SessionProtocol>,
    config: TransactionConfig,
    state: Mutex<TransactionState>,
    strategy: RwLock<Arc<dyn TransactionStrategy>>,
    listeners: RwLock<Vec<Arc<dyn TransactionListener>>>,
    handlers: RwLock<Vec<Arc<dyn TransactionHandler>>>,
    resolvers: RwLock<Vec<Arc<dyn ConflictResolver>>>,
    invalidation: Mutex<Option<ListenerId>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(listener) = self.invalidation.get_mut().take() {
            self.session.notifications().unsubscribe(listener);
        }
    }
}

/// A unit of work against a versioned object repository.
///
/// Cloning a `Transaction` yields another handle to the same transaction.
///
/// # Example
///
/// ```
/// use revtx_core::Transaction;
/// use revtx_model::{ClassInfo, FeatureInfo};
/// use revtx_protocol::MockSession;
/// use std::sync::Arc;
///
/// let tx = Transaction::new(Arc::new(MockSession::new()));
/// let class = Arc::new(ClassInfo::new("shop", "Order").with_feature(FeatureInfo::attribute("total")));
/// let order = tx.new_object(class).unwrap();
/// tx.set(order, "total", 42i64).unwrap();
/// assert!(tx.is_dirty().unwrap());
///
/// tx.rollback().unwrap();
/// assert!(!tx.is_dirty().unwrap());
/// ```
#[derive(Clone)]
pub struct Transaction {
    shared: Arc<Shared>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.shared.id)
            .field("branch", &self.shared.config.branch)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// Opens a transaction with the default configuration.
    pub fn new(session: Arc<dyn SessionProtocol>) -> Self {
        Self::with_config(session, TransactionConfig::default())
    }

    /// Opens a transaction with a custom configuration.
    pub fn with_config(session: Arc<dyn SessionProtocol>, config: TransactionConfig) -> Self {
        let id = next_transaction_id();
        let state = TransactionState::new(id, BranchPoint::head(config.branch));
        debug!(transaction = %id, branch = %config.branch, "transaction opened");
        Self {
            shared: Arc::new(Shared {
                id,
                session,
                config,
                state: Mutex::new(state),
                strategy: RwLock::new(Arc::new(DefaultStrategy)),
                listeners: RwLock::new(Vec::new()),
                handlers: RwLock::new(Vec::new()),
                resolvers: RwLock::new(Vec::new()),
                invalidation: Mutex::new(None),
            }),
        }
    }

    /// Transaction identity, also its view ID on the wire.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.shared.id
    }

    /// The transaction's configuration.
    #[must_use]
    pub fn config(&self) -> &TransactionConfig {
        &self.shared.config
    }

    /// The session the transaction talks to.
    #[must_use]
    pub fn session(&self) -> &Arc<dyn SessionProtocol> {
        &self.shared.session
    }

    /// Returns true if both handles refer to the same transaction.
    #[must_use]
    pub fn ptr_eq(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Runs `f` under the transaction lock, then delivers the events it
    /// raised.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut TransactionState) -> CoreResult<R>) -> CoreResult<R> {
        let (result, events) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(CoreError::TransactionClosed);
            }
            let result = f(&mut state);
            (result, std::mem::take(&mut state.events))
        };
        if !events.is_empty() {
            let listeners = self.shared.listeners.read().clone();
            for event in &events {
                for listener in &listeners {
                    listener.on_event(self, event);
                }
            }
        }
        result
    }

    pub(crate) fn handlers(&self) -> Vec<Arc<dyn TransactionHandler>> {
        self.shared.handlers.read().clone()
    }

    pub(crate) fn strategy(&self) -> Arc<dyn TransactionStrategy> {
        self.shared.strategy.read().clone()
    }

    pub(crate) fn set_strategy(&self, strategy: Arc<dyn TransactionStrategy>) {
        *self.shared.strategy.write() = strategy;
    }

    pub(crate) fn notify_committed(&self, info: &CommitInfo) {
        for handler in self.handlers() {
            if let Err(err) = handler.committed(self, info) {
                warn!(transaction = %self.id(), error = %err, "commit handler failed");
            }
        }
    }

    // Objects

    /// Creates a new object of `class` and returns its temporary ID.
    pub fn new_object(&self, class: Arc<ClassInfo>) -> CoreResult<ObjectId> {
        self.with_state(|state| state.new_object(class))
    }

    /// Registers a revision loaded elsewhere as a clean object.
    ///
    /// Does nothing if the object is already known.
    pub fn load_object(&self, revision: Revision) -> CoreResult<()> {
        self.with_state(|state| state.load_object(revision))
    }

    /// Returns a snapshot of a live object, if the transaction knows it.
    pub fn object(&self, id: ObjectId) -> CoreResult<Option<ManagedObject>> {
        self.with_state(|state| Ok(state.objects.live(id).cloned()))
    }

    /// Returns a live object, loading it from the repository first if needed.
    pub fn get_or_load(&self, id: ObjectId) -> CoreResult<ManagedObject> {
        let point = self.with_state(|state| {
            if state.objects.is_retired(id) || (id.is_temporary() && !state.objects.is_live(id)) {
                return Err(CoreError::ObjectNotFound(id));
            }
            Ok(state.branch_point)
        })?;
        if let Some(object) = self.object(id)? {
            return Ok(object);
        }

        let request = LoadRevisionsRequest::new(vec![id], point);
        let revisions = with_retry(&self.config().retry, || self.session().load_revisions(&request))?;
        let revision = revisions
            .into_iter()
            .find(|r| r.id() == id)
            .ok_or(CoreError::ObjectNotFound(id))?;
        self.with_state(|state| {
            state.load_object(revision)?;
            state.objects.require_live(id).cloned()
        })
    }

    /// Sets a single-valued feature.
    pub fn set(&self, id: ObjectId, feature: &str, value: impl Into<FeatureValue>) -> CoreResult<()> {
        let value = value.into();
        self.with_state(|state| state.set_value(id, feature, value))
    }

    /// Unsets a feature.
    pub fn unset(&self, id: ObjectId, feature: &str) -> CoreResult<()> {
        self.with_state(|state| state.unset_value(id, feature))
    }

    /// Inserts into a many-valued feature.
    pub fn add(&self, id: ObjectId, feature: &str, index: usize, value: impl Into<FeatureValue>) -> CoreResult<()> {
        let value = value.into();
        self.with_state(|state| state.add_value(id, feature, index, value))
    }

    /// Appends to a many-valued feature.
    pub fn push(&self, id: ObjectId, feature: &str, value: impl Into<FeatureValue>) -> CoreResult<()> {
        let value = value.into();
        self.with_state(|state| {
            let index = state.objects.require_live(id)?.revision.size(feature)?;
            state.add_value(id, feature, index, value)
        })
    }

    /// Removes the element at `index` and returns it.
    pub fn remove(&self, id: ObjectId, feature: &str, index: usize) -> CoreResult<FeatureValue> {
        self.with_state(|state| state.remove_value(id, feature, index))
    }

    /// Moves an element within a many-valued feature.
    pub fn move_element(&self, id: ObjectId, feature: &str, from: usize, to: usize) -> CoreResult<()> {
        self.with_state(|state| state.move_value(id, feature, from, to))
    }

    /// Empties a many-valued feature.
    pub fn clear(&self, id: ObjectId, feature: &str) -> CoreResult<()> {
        self.with_state(|state| state.clear_value(id, feature))
    }

    /// Sets the container of an object, keeping its resource.
    pub fn set_container(&self, id: ObjectId, container: Option<ObjectId>, feature: Option<&str>) -> CoreResult<()> {
        self.with_state(|state| {
            let resource = state.objects.require_live(id)?.revision.resource();
            state.set_container(id, container, feature.map(str::to_owned), resource)
        })
    }

    /// Sets the resource of an object, keeping its container.
    pub fn set_resource(&self, id: ObjectId, resource: Option<ObjectId>) -> CoreResult<()> {
        self.with_state(|state| {
            let revision = &state.objects.require_live(id)?.revision;
            let container = revision.container();
            let feature = revision.containing_feature().map(str::to_owned);
            state.set_container(id, container, feature, resource)
        })
    }

    /// Adds `child` to the containment `feature` of `parent`.
    pub fn add_child(&self, parent: ObjectId, feature: &str, child: ObjectId) -> CoreResult<()> {
        self.with_state(|state| state.add_child(parent, feature, child))
    }

    /// Sets a large-object feature. The payload is uploaded at commit if the
    /// repository does not have it yet.
    pub fn set_lob(&self, id: ObjectId, feature: &str, lob: Lob) -> CoreResult<()> {
        self.with_state(|state| state.set_lob(id, feature, lob))
    }

    /// Detaches an object and everything it contains.
    ///
    /// Returns the detached IDs, root first.
    pub fn detach(&self, id: ObjectId) -> CoreResult<Vec<ObjectId>> {
        self.with_state(|state| state.detach(id))
    }

    /// Brings a detached object back in the state it was detached from.
    pub fn reattach(&self, id: ObjectId) -> CoreResult<()> {
        self.with_state(|state| state.reattach(id))
    }

    // Savepoints

    /// Sets a savepoint; later edits can be rolled back to it.
    pub fn set_savepoint(&self) -> CoreResult<SavepointHandle> {
        self.with_state(|state| {
            state.check_writable()?;
            Ok(state.set_savepoint())
        })
    }

    /// Handles of the savepoints on the chain, first to last.
    pub fn savepoints(&self) -> CoreResult<Vec<SavepointHandle>> {
        self.with_state(|state| Ok(state.chain.handles()))
    }

    /// Discards every pending change.
    pub fn rollback(&self) -> CoreResult<()> {
        let first = self.with_state(|state| Ok(state.chain.first_handle()))?;
        self.rollback_to(first)
    }

    /// Discards the changes made after `savepoint` was set.
    pub fn rollback_to(&self, savepoint: SavepointHandle) -> CoreResult<()> {
        self.strategy().rollback(self, savepoint)
    }

    pub(crate) fn rollback_local(&self, savepoint: SavepointHandle) -> CoreResult<()> {
        let config = self.config();
        let release_locks = self.with_state(|state| {
            state.check_writable()?;
            let index = state.chain.position(savepoint)?;
            state.rollback_to_index(index)?;
            state.events.push(TransactionEvent::Finished {
                kind: FinishKind::RolledBack,
                id_mappings: Default::default(),
            });
            info!(transaction = %state.id, savepoint = %savepoint.id(), "rolled back");
            Ok(index == 0 && config.auto_release_locks && !state.lock_states.is_empty())
        })?;

        if release_locks {
            if let Err(err) = self.unlock_objects(None) {
                warn!(transaction = %self.id(), error = %err, "releasing locks after rollback failed");
            }
        }
        for handler in self.handlers() {
            if let Err(err) = handler.rolled_back(self) {
                warn!(transaction = %self.id(), error = %err, "rollback handler failed");
            }
        }
        Ok(())
    }

    // Commit

    /// Commits every pending change.
    ///
    /// Returns `None` if there was nothing to commit.
    pub fn commit(&self) -> CoreResult<Option<CommitInfo>> {
        self.strategy().commit(self)
    }

    /// Builds the payload the next commit would send, without committing.
    pub fn commit_context(&self) -> CoreResult<Option<CommitContext>> {
        self.with_state(|state| Ok(state.dirty.then(|| CommitContext::build(state))))
    }

    /// Sets the comment recorded with the next commit.
    pub fn set_commit_comment(&self, comment: Option<String>) -> CoreResult<()> {
        self.with_state(|state| {
            state.comment = comment;
            Ok(())
        })
    }

    /// Restricts the next commit to `ids`; `None` commits everything.
    pub fn set_committables(&self, ids: Option<BTreeSet<ObjectId>>) -> CoreResult<()> {
        self.with_state(|state| {
            state.committables = ids;
            Ok(())
        })
    }

    /// Timestamp of the last commit made by this transaction.
    pub fn last_commit_time(&self) -> CoreResult<Timestamp> {
        self.with_state(|state| Ok(state.last_commit_time))
    }

    // Queries

    /// Returns true if the transaction has pending changes.
    pub fn is_dirty(&self) -> CoreResult<bool> {
        self.with_state(|state| Ok(state.dirty))
    }

    /// Returns true if any object conflicts with a remote change.
    pub fn has_conflict(&self) -> CoreResult<bool> {
        self.with_state(|state| Ok(state.conflicts > 0))
    }

    /// Number of conflicting objects.
    pub fn conflict_count(&self) -> CoreResult<usize> {
        self.with_state(|state| Ok(state.conflicts))
    }

    /// Returns true if `id` was created by this transaction, is still
    /// attached and has not been committed yet.
    pub fn is_new_object(&self, id: ObjectId) -> CoreResult<bool> {
        self.with_state(|state| Ok(state.objects.is_live(id) && state.chain.is_new_object(id)))
    }

    /// Pending changes as a change set.
    pub fn change_set_data(&self) -> CoreResult<ChangeSetData> {
        self.with_state(|state| Ok(state.change_set_data()))
    }

    /// Pending deltas of persistent objects, merged across savepoints.
    pub fn revision_deltas(&self) -> CoreResult<BTreeMap<ObjectId, RevisionDelta>> {
        self.with_state(|state| Ok(state.chain.all_revision_deltas()))
    }

    /// Lock states held by this transaction.
    pub fn lock_states(&self) -> CoreResult<Vec<LockState>> {
        self.with_state(|state| Ok(state.lock_states.values().cloned().collect()))
    }

    // Change sets

    /// Merges a change set made elsewhere into this clean transaction.
    pub fn apply_change_set_data(&self, data: &ChangeSetData) -> CoreResult<Vec<ObjectChange>> {
        self.with_state(|state| state.apply_change_set_data(data))
    }

    /// Replays a change set computed against `base` as local edits.
    pub fn apply_change_set(
        &self,
        data: &ChangeSetData,
        base: &dyn RevisionProvider,
        keep_versions: bool,
    ) -> CoreResult<Vec<ObjectChange>> {
        self.with_state(|state| state.apply_change_set(data, base, keep_versions))
    }

    /// Undoes a change set previously applied on top of `base`.
    pub fn revert_change_set_data(
        &self,
        data: &ChangeSetData,
        base: &dyn RevisionProvider,
    ) -> CoreResult<Vec<ObjectChange>> {
        self.with_state(|state| state.revert_change_set_data(data, base))
    }

    // Remote changes

    /// Brings the transaction up to date with a commit made by another view,
    /// then runs the registered conflict resolvers.
    pub fn handle_remote_invalidation(&self, info: &CommitInfo) -> CoreResult<Vec<ObjectChange>> {
        let resolvers = self.shared.resolvers.read().clone();
        self.with_state(|state| {
            let changes = state.invalidate(info)?;
            state.resolve_conflicts(&resolvers)?;
            Ok(changes)
        })
    }

    /// Subscribes to the session's commit notifications and invalidates on a
    /// background thread.
    ///
    /// The thread holds only a weak reference and exits once the last handle
    /// is dropped or the transaction is closed.
    pub fn enable_remote_invalidation(&self) -> CoreResult<()> {
        let mut slot = self.shared.invalidation.lock();
        if slot.is_some() {
            return Ok(());
        }

        let (sender, receiver) = mpsc::channel::<CommitInfo>();
        let sender = Mutex::new(sender);
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        std::thread::Builder::new()
            .name(format!("revtx-invalidation-{}", self.id().as_u32()))
            .spawn(move || {
                while let Ok(info) = receiver.recv() {
                    let Some(shared) = weak.upgrade() else {
                        break;
                    };
                    let transaction = Transaction { shared };
                    match transaction.handle_remote_invalidation(&info) {
                        Ok(_) => {}
                        Err(CoreError::TransactionClosed) => break,
                        Err(err) => {
                            warn!(transaction = %transaction.id(), error = %err, "remote invalidation failed");
                        }
                    }
                }
            })?;

        let listener = move |notification: &SessionNotification| {
            if let SessionNotification::Commit(info) = notification {
                let _ = sender.lock().send(info.clone());
            }
        };
        *slot = Some(self.session().notifications().subscribe(Arc::new(listener)));
        debug!(transaction = %self.id(), "remote invalidation enabled");
        Ok(())
    }

    // Registration

    /// Registers a listener for transaction events.
    pub fn add_listener(&self, listener: Arc<dyn TransactionListener>) {
        self.shared.listeners.write().push(listener);
    }

    /// Registers a commit/rollback handler.
    pub fn add_handler(&self, handler: Arc<dyn TransactionHandler>) {
        self.shared.handlers.write().push(handler);
    }

    /// Registers a conflict resolver.
    pub fn add_resolver(&self, resolver: Arc<dyn ConflictResolver>) {
        self.shared.resolvers.write().push(resolver);
    }

    /// Rolls back pending changes and closes the transaction.
    ///
    /// Every later operation fails with [`CoreError::TransactionClosed`].
    pub fn close(&self) -> CoreResult<()> {
        if self.is_dirty()? {
            self.rollback()?;
        }
        if let Some(listener) = self.shared.invalidation.lock().take() {
            self.session().notifications().unsubscribe(listener);
        }
        self.with_state(|state| {
            state.closed = true;
            Ok(())
        })?;
        debug!(transaction = %self.id(), "transaction closed");
        Ok(())
    }

    /// Returns true once [`close`](Self::close) succeeded.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}
