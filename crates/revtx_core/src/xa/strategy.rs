//! Commit strategy of an XA participant.

use super::XaTransaction;
use crate::error::CoreResult;
use crate::transaction::{DefaultStrategy, Transaction, TransactionStrategy};
use revtx_protocol::CommitInfo;
use std::sync::Weak;
use tracing::debug;

/// Forwards a participant's commit to its coordinator, so committing any
/// participant commits all of them.
pub(crate) struct XaParticipantStrategy {
    coordinator: Weak<XaTransaction>,
}

impl XaParticipantStrategy {
    pub(crate) fn new(coordinator: Weak<XaTransaction>) -> Self {
        Self { coordinator }
    }
}

impl TransactionStrategy for XaParticipantStrategy {
    fn commit(&self, transaction: &Transaction) -> CoreResult<Option<CommitInfo>> {
        let Some(coordinator) = self.coordinator.upgrade() else {
            debug!(transaction = %transaction.id(), "xa coordinator gone, committing alone");
            return DefaultStrategy.commit(transaction);
        };
        let infos = coordinator.commit()?;
        Ok(infos
            .into_iter()
            .find(|(id, _)| *id == transaction.id())
            .map(|(_, info)| info))
    }
}
