//! Pluggable commit and rollback behavior.

use super::Transaction;
use crate::error::{CommitFailure, CoreError, CoreResult};
use crate::savepoint::SavepointHandle;
use revtx_protocol::CommitInfo;
use std::collections::HashMap;
use tracing::{debug, warn};

/// How a transaction commits and rolls back.
///
/// A plain transaction commits on its own; a participant of an XA
/// transaction forwards its commit to the coordinator.
pub trait TransactionStrategy: Send + Sync {
    /// Commits the pending changes of `transaction`.
    fn commit(&self, transaction: &Transaction) -> CoreResult<Option<CommitInfo>>;

    /// Rolls `transaction` back to `savepoint`.
    fn rollback(&self, transaction: &Transaction, savepoint: SavepointHandle) -> CoreResult<()> {
        transaction.rollback_local(savepoint)
    }
}

/// Single-phase commit through `commit_transaction`.
///
/// The transaction lock is held across the round trip so no edit can slip
/// in between building the payload and applying the result.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultStrategy;

impl TransactionStrategy for DefaultStrategy {
    fn commit(&self, transaction: &Transaction) -> CoreResult<Option<CommitInfo>> {
        let config = transaction.config();
        let handlers = transaction.handlers();
        let session = transaction.session();

        let info = transaction.with_state(|state| {
            let Some(mut context) = state.prepare_commit(config, &handlers)? else {
                debug!(transaction = %state.id, "nothing to commit");
                return Ok(None);
            };
            context.collect_lobs(state, session.as_ref(), &config.retry)?;
            let result = session.commit_transaction(&context.request(config))?;
            if let Some(failure) = CommitFailure::from_result(&result) {
                warn!(transaction = %state.id, reason = failure.message(), "commit rejected");
                return Err(CoreError::Commit(failure));
            }
            state
                .post_commit(&mut context, &result, &HashMap::new(), config)
                .map(Some)
        })?;

        if let Some(info) = &info {
            transaction.notify_committed(info);
        }
        Ok(info)
    }
}
