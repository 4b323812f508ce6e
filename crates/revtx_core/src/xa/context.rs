//! Per-participant state of a distributed commit.

use crate::commit::CommitContext;
use crate::error::{CommitFailure, CoreError, CoreResult};
use crate::transaction::Transaction;
use crate::types::TransactionId;
use revtx_model::{FeatureDelta, ObjectId};
use revtx_protocol::{CommitInfo, CommitTransactionResult, XaPhase2Request};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// Where one participant stands in the three-phase protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaState {
    /// Payload not sent yet.
    Phase1,
    /// Payload sent; waiting for the other participants' ID mappings.
    Phase2,
    /// Mappings exchanged; waiting to finalize.
    Phase3,
    /// Aborted.
    Cancel,
    /// Committed, or had nothing to commit.
    Done,
}

impl XaState {
    /// Returns true while the repository may hold prepared state.
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Phase1 | Self::Phase2 | Self::Phase3)
    }
}

/// One participant of an [`XaTransaction`](super::XaTransaction) commit.
pub struct XaCommitContext {
    transaction: Transaction,
    state: XaState,
    context: Option<CommitContext>,
    result: Option<CommitTransactionResult>,
    requested_ids: BTreeSet<ObjectId>,
    foreign_mappings: HashMap<ObjectId, ObjectId>,
    info: Option<CommitInfo>,
    failure: Option<CoreError>,
}

impl XaCommitContext {
    pub(crate) fn new(transaction: Transaction) -> Self {
        Self {
            transaction,
            state: XaState::Phase1,
            context: None,
            result: None,
            requested_ids: BTreeSet::new(),
            foreign_mappings: HashMap::new(),
            info: None,
            failure: None,
        }
    }

    /// Participant identity.
    #[must_use]
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction.id()
    }

    /// Current phase.
    #[must_use]
    pub fn state(&self) -> XaState {
        self.state
    }

    /// Temporary IDs of other participants' objects this participant refers to.
    #[must_use]
    pub fn requested_ids(&self) -> &BTreeSet<ObjectId> {
        &self.requested_ids
    }

    /// ID mappings this participant assigned in phase 1.
    #[must_use]
    pub fn id_mappings(&self) -> Option<&HashMap<ObjectId, ObjectId>> {
        self.result.as_ref().map(|r| &r.id_mappings)
    }

    /// Picks the mappings this participant asked for out of what every
    /// participant assigned, skipping its own.
    pub(crate) fn set_foreign_mappings(&mut self, assigned: &HashMap<ObjectId, (TransactionId, ObjectId)>) {
        let me = self.transaction.id();
        self.foreign_mappings = self
            .requested_ids
            .iter()
            .filter_map(|id| match assigned.get(id) {
                Some((owner, to)) if *owner != me => Some((*id, *to)),
                _ => None,
            })
            .collect();
    }

    pub(crate) fn take_info(&mut self) -> Option<CommitInfo> {
        self.info.take()
    }

    /// Phase-3 failure of this participant, if any.
    pub(crate) fn take_failure(&mut self) -> Option<CoreError> {
        self.failure.take()
    }

    /// Runs the participant's current phase and advances it.
    ///
    /// A phase-3 failure is local to the participant: it is cancelled and
    /// the error is kept on the context, so the others still finalize.
    pub fn run(&mut self) -> CoreResult<()> {
        match self.state {
            XaState::Phase1 => self.phase1().map_err(|err| CoreError::xa(1, self.transaction.id(), err)),
            XaState::Phase2 => self.phase2().map_err(|err| CoreError::xa(2, self.transaction.id(), err)),
            XaState::Phase3 => {
                if let Err(err) = self.phase3() {
                    warn!(transaction = %self.transaction.id(), error = %err, "xa phase 3 failed");
                    self.cancel();
                    self.failure = Some(CoreError::xa(3, self.transaction.id(), err));
                }
                Ok(())
            }
            XaState::Cancel | XaState::Done => Ok(()),
        }
    }

    fn phase1(&mut self) -> CoreResult<()> {
        let tx = &self.transaction;
        let config = tx.config();
        let handlers = tx.handlers();
        let session = tx.session();
        let prepared = tx.with_state(|state| {
            let Some(mut context) = state.prepare_commit(config, &handlers)? else {
                return Ok(None);
            };
            context.collect_lobs(state, session.as_ref(), &config.retry)?;
            let result = session.commit_xa_phase1(&context.request(config))?;
            if let Some(failure) = CommitFailure::from_result(&result) {
                return Err(CoreError::Commit(failure));
            }
            state.commit_in_progress = true;
            Ok(Some((context, result)))
        })?;

        match prepared {
            Some((context, result)) => {
                self.requested_ids = foreign_references(&context);
                debug!(
                    transaction = %tx.id(),
                    mappings = result.id_mappings.len(),
                    requested = self.requested_ids.len(),
                    "xa phase 1 done"
                );
                self.context = Some(context);
                self.result = Some(result);
                self.state = XaState::Phase2;
            }
            None => self.state = XaState::Done,
        }
        Ok(())
    }

    fn phase2(&mut self) -> CoreResult<()> {
        let request = XaPhase2Request {
            view_id: self.transaction.id().as_u32(),
            id_mappings: self.foreign_mappings.clone(),
        };
        self.transaction.session().commit_xa_phase2(&request)?;
        self.state = XaState::Phase3;
        Ok(())
    }

    fn phase3(&mut self) -> CoreResult<()> {
        let tx = &self.transaction;
        let (Some(context), Some(result)) = (self.context.as_mut(), self.result.as_ref()) else {
            return Err(CoreError::invalid_operation("phase 3 without a prepared commit"));
        };
        tx.session().commit_xa_phase3(tx.id().as_u32())?;
        // Durable from here on; only local bookkeeping remains.
        self.state = XaState::Done;

        let foreign = &self.foreign_mappings;
        let info = tx.with_state(|state| {
            state.commit_in_progress = false;
            state.post_commit(context, result, foreign, tx.config())
        })?;
        tx.notify_committed(&info);
        self.info = Some(info);
        Ok(())
    }

    /// Aborts the participant. Failures are logged; the local transaction
    /// keeps its changes either way.
    pub fn cancel(&mut self) {
        if !self.state.is_pending() {
            return;
        }
        let tx = &self.transaction;
        if let Err(err) = tx.session().commit_xa_cancel(tx.id().as_u32()) {
            warn!(transaction = %tx.id(), error = %err, "xa cancel failed");
        }
        let cleared = tx.with_state(|state| {
            state.commit_in_progress = false;
            Ok(())
        });
        if let Err(err) = cleared {
            warn!(transaction = %tx.id(), error = %err, "could not reopen transaction after cancel");
        }
        self.state = XaState::Cancel;
    }
}

impl std::fmt::Debug for XaCommitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XaCommitContext")
            .field("transaction", &self.transaction.id())
            .field("state", &self.state)
            .field("requested_ids", &self.requested_ids)
            .finish_non_exhaustive()
    }
}

/// Temporary IDs referenced by `context` that it does not create itself.
fn foreign_references(context: &CommitContext) -> BTreeSet<ObjectId> {
    let mut ids = BTreeSet::new();
    let mut note = |id: ObjectId| {
        if id.is_temporary() && !context.new_objects().contains_key(&id) {
            ids.insert(id);
        }
    };
    for revision in context.new_objects().values() {
        revision.for_each_reference(|_, target| note(target));
        if let Some(container) = revision.container_or_resource() {
            note(container);
        }
    }
    for delta in context.revision_deltas().values() {
        for change in delta.feature_deltas() {
            visit_ids(change, &mut note);
        }
    }
    ids
}

fn visit_ids(change: &FeatureDelta, f: &mut impl FnMut(ObjectId)) {
    match change {
        FeatureDelta::Set { value, .. }
        | FeatureDelta::Add { value, .. }
        | FeatureDelta::Remove { value, .. }
        | FeatureDelta::Move { value, .. } => value.for_each_id(f),
        FeatureDelta::Container {
            container, resource, ..
        } => {
            container.iter().chain(resource.iter()).for_each(|id| f(*id));
        }
        FeatureDelta::List { changes, .. } => {
            for inner in changes {
                visit_ids(inner, f);
            }
        }
        FeatureDelta::Unset { .. } | FeatureDelta::Clear { .. } => {}
    }
}
