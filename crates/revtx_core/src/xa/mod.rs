//! Distributed commit across several transactions.
//!
//! An [`XaTransaction`] groups transactions that may live on different
//! sessions, even different repositories, and commits them together in
//! three phases:
//!
//! 1. every participant sends its payload and receives provisional
//!    permanent IDs for its new objects;
//! 2. each participant is told the IDs other participants assigned to the
//!    objects it refers to;
//! 3. every participant finalizes and applies the result locally.
//!
//! A failure in phase 1 or 2 cancels every participant that has not
//! finished. A failure in phase 3 only cancels the participant that failed;
//! the others may already be durable and still finalize. Participants keep
//! their changes after a cancel.

mod context;
mod executor;
mod strategy;

pub use context::{XaCommitContext, XaState};
pub use executor::{ParallelExecutor, SequentialExecutor, XaExecutor};

use crate::config::XaConfig;
use crate::error::{CoreError, CoreResult};
use crate::savepoint::{SavepointChain, SavepointHandle};
use crate::transaction::{next_transaction_id, DefaultStrategy, Transaction};
use crate::types::TransactionId;
use parking_lot::Mutex;
use revtx_model::ObjectId;
use revtx_protocol::CommitInfo;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use strategy::XaParticipantStrategy;
use tracing::{debug, info, warn};

/// Temporary IDs of each participant start this far apart so cross
/// references and ID mappings are unambiguous.
const PARTICIPANT_ID_SPACING: u32 = 1 << 20;

/// Participant savepoints captured by one XA savepoint.
#[derive(Debug, Clone, Default)]
struct ParticipantSavepoints(Vec<(TransactionId, SavepointHandle)>);

impl ParticipantSavepoints {
    fn get(&self, id: TransactionId) -> Option<SavepointHandle> {
        self.0.iter().find(|(t, _)| *t == id).map(|(_, handle)| *handle)
    }
}

/// A group of transactions committed atomically.
pub struct XaTransaction {
    id: TransactionId,
    me: Weak<XaTransaction>,
    executor: Arc<dyn XaExecutor>,
    participants: Mutex<Vec<Transaction>>,
    chain: Mutex<SavepointChain<ParticipantSavepoints>>,
    committing: Mutex<()>,
}

impl std::fmt::Debug for XaTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XaTransaction")
            .field("id", &self.id)
            .field("participants", &self.participants.lock().len())
            .finish_non_exhaustive()
    }
}

impl XaTransaction {
    /// Creates an empty XA transaction.
    pub fn new(config: XaConfig) -> Arc<Self> {
        let id = next_transaction_id();
        Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            executor: config.build_executor(),
            participants: Mutex::new(Vec::new()),
            chain: Mutex::new(SavepointChain::new(id)),
            committing: Mutex::new(()),
        })
    }

    /// Identity of the group.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Adds a participant. From now on, committing it commits the group.
    pub fn add(&self, transaction: &Transaction) -> CoreResult<()> {
        let mut participants = self.participants.lock();
        if participants.iter().any(|p| p.ptr_eq(transaction)) {
            return Ok(());
        }
        let offset = u32::try_from(participants.len() + 1)
            .ok()
            .and_then(|n| n.checked_mul(PARTICIPANT_ID_SPACING))
            .ok_or_else(|| CoreError::invalid_operation("too many xa participants"))?;
        transaction.with_state(|state| {
            state.ids.set_floor(offset);
            Ok(())
        })?;
        transaction.set_strategy(Arc::new(XaParticipantStrategy::new(self.me.clone())));
        participants.push(transaction.clone());
        debug!(xa = %self.id, transaction = %transaction.id(), "participant added");
        Ok(())
    }

    /// Removes a participant; it commits on its own again.
    pub fn remove(&self, transaction: &Transaction) -> bool {
        let mut participants = self.participants.lock();
        let before = participants.len();
        participants.retain(|p| !p.ptr_eq(transaction));
        let removed = participants.len() != before;
        if removed {
            transaction.set_strategy(Arc::new(DefaultStrategy));
            let lowered = transaction.with_state(|state| {
                state.ids.set_floor(0);
                Ok(())
            });
            if let Err(err) = lowered {
                debug!(xa = %self.id, transaction = %transaction.id(), error = %err, "removed closed participant");
            }
        }
        removed
    }

    /// Current participants.
    #[must_use]
    pub fn participants(&self) -> Vec<Transaction> {
        self.participants.lock().clone()
    }

    /// Commits every participant.
    ///
    /// Returns the commit info of each participant that had changes.
    pub fn commit(&self) -> CoreResult<Vec<(TransactionId, CommitInfo)>> {
        let _guard = self.committing.lock();
        let mut contexts: Vec<XaCommitContext> = self
            .participants()
            .into_iter()
            .map(XaCommitContext::new)
            .collect();

        if let Err(err) = self.executor.run_phase(XaState::Phase1, &mut contexts) {
            self.cancel_all(&mut contexts);
            return Err(err);
        }

        let assigned = match Self::collect_mappings(&contexts) {
            Ok(assigned) => assigned,
            Err(err) => {
                self.cancel_all(&mut contexts);
                return Err(err);
            }
        };
        for context in &mut contexts {
            context.set_foreign_mappings(&assigned);
        }

        if let Err(err) = self.executor.run_phase(XaState::Phase2, &mut contexts) {
            self.cancel_all(&mut contexts);
            return Err(err);
        }
        let finished = self.executor.run_phase(XaState::Phase3, &mut contexts);
        for context in contexts.iter_mut().filter(|c| c.state() == XaState::Phase3) {
            context.cancel();
        }
        self.chain.lock().reset();
        finished?;

        let mut failures: Vec<CoreError> = contexts
            .iter_mut()
            .filter_map(XaCommitContext::take_failure)
            .collect();
        if !failures.is_empty() {
            warn!(xa = %self.id, failed = failures.len(), "xa commit finished with local failures");
            return Err(failures.swap_remove(0));
        }

        let infos: Vec<(TransactionId, CommitInfo)> = contexts
            .iter_mut()
            .filter_map(|c| c.take_info().map(|info| (c.transaction_id(), info)))
            .collect();
        info!(xa = %self.id, committed = infos.len(), mapped = assigned.len(), "xa commit finished");
        Ok(infos)
    }

    /// Every ID mapping assigned in phase 1, with the participant that
    /// assigned it.
    fn collect_mappings(contexts: &[XaCommitContext]) -> CoreResult<HashMap<ObjectId, (TransactionId, ObjectId)>> {
        let mut assigned = HashMap::new();
        for context in contexts {
            let Some(mappings) = context.id_mappings() else {
                continue;
            };
            let owner = context.transaction_id();
            for (from, to) in mappings {
                if let Some((other, _)) = assigned.insert(*from, (owner, *to)) {
                    if other != owner {
                        return Err(CoreError::invalid_operation(format!(
                            "temporary id {from} was issued by both {other} and {owner}"
                        )));
                    }
                }
            }
        }
        Ok(assigned)
    }

    fn cancel_all(&self, contexts: &mut [XaCommitContext]) {
        let pending = contexts.iter().filter(|c| c.state().is_pending()).count();
        warn!(xa = %self.id, pending, "cancelling xa commit");
        for context in contexts.iter_mut() {
            context.cancel();
        }
    }

    /// Rolls every participant back completely.
    pub fn rollback(&self) -> CoreResult<()> {
        for participant in self.participants() {
            participant.rollback()?;
        }
        self.chain.lock().reset();
        Ok(())
    }

    /// Sets a savepoint on every participant.
    pub fn set_savepoint(&self) -> CoreResult<SavepointHandle> {
        let mut captured = Vec::new();
        for participant in self.participants() {
            captured.push((participant.id(), participant.set_savepoint()?));
        }
        let mut chain = self.chain.lock();
        let handle = chain.push();
        *chain.last_mut() = ParticipantSavepoints(captured);
        Ok(handle)
    }

    /// Rolls every participant back to where it was when `savepoint` was set.
    ///
    /// Participants added after that roll back completely.
    pub fn rollback_to(&self, savepoint: SavepointHandle) -> CoreResult<()> {
        let captured = {
            let chain = self.chain.lock();
            let index = chain.position(savepoint)?;
            chain.get(index).cloned().unwrap_or_default()
        };
        for participant in self.participants() {
            match captured.get(participant.id()) {
                Some(handle) => participant.rollback_to(handle)?,
                None => participant.rollback()?,
            }
        }
        let mut chain = self.chain.lock();
        let index = chain.position(savepoint)?;
        chain.truncate_after(index);
        Ok(())
    }
}
