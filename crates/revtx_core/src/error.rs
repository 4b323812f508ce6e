//! Error types for the transaction engine.

use crate::object::{ObjectEvent, ObjectState};
use crate::types::TransactionId;
use revtx_model::{BranchPoint, ModelError, ObjectId, Timestamp, Version};
use revtx_protocol::{CommitTransactionResult, ObjectReference, ProtocolError};
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// A commit the repository refused.
///
/// Built from the rollback message of a [`CommitTransactionResult`]. A
/// non-empty list of cross-references marks a referential-integrity
/// violation rather than a plain rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitFailure {
    /// The repository rejected the commit.
    Rejected {
        /// Rollback message sent by the repository.
        message: String,
        /// Branch point the commit was attempted at.
        branch_point: BranchPoint,
        /// Timestamp of the last commit the repository knew of.
        previous_timestamp: Timestamp,
    },
    /// The commit would have left dangling cross-references.
    ReferentialIntegrity {
        /// Rollback message sent by the repository.
        message: String,
        /// Branch point the commit was attempted at.
        branch_point: BranchPoint,
        /// Timestamp of the last commit the repository knew of.
        previous_timestamp: Timestamp,
        /// References that would dangle.
        xrefs: Vec<ObjectReference>,
    },
}

impl CommitFailure {
    /// Translates a rejected commit result; returns `None` for a success.
    pub fn from_result(result: &CommitTransactionResult) -> Option<Self> {
        let message = result.rollback_message.clone()?;
        Some(if result.xrefs.is_empty() {
            Self::Rejected {
                message,
                branch_point: result.branch_point,
                previous_timestamp: result.previous_timestamp,
            }
        } else {
            Self::ReferentialIntegrity {
                message,
                branch_point: result.branch_point,
                previous_timestamp: result.previous_timestamp,
                xrefs: result.xrefs.clone(),
            }
        })
    }

    /// Returns the repository's rollback message.
    pub fn message(&self) -> &str {
        match self {
            Self::Rejected { message, .. } | Self::ReferentialIntegrity { message, .. } => message,
        }
    }

    /// Returns the branch point of the failed attempt.
    pub fn branch_point(&self) -> BranchPoint {
        match self {
            Self::Rejected { branch_point, .. } | Self::ReferentialIntegrity { branch_point, .. } => {
                *branch_point
            }
        }
    }

    /// Returns the dangling references, empty for a plain rejection.
    pub fn xrefs(&self) -> &[ObjectReference] {
        match self {
            Self::Rejected { .. } => &[],
            Self::ReferentialIntegrity { xrefs, .. } => xrefs,
        }
    }
}

impl fmt::Display for CommitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected { message, .. } => write!(f, "rejected: {message}"),
            Self::ReferentialIntegrity { message, xrefs, .. } => {
                write!(f, "referential integrity: {message} ({} xrefs)", xrefs.len())
            }
        }
    }
}

/// Errors that can occur in transaction operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Session protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Model error, e.g. an unknown feature or a bad list index.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// I/O error while exporting or importing changes.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The repository refused the commit.
    #[error("commit failed: {0}")]
    Commit(CommitFailure),

    /// The savepoint is no longer on the transaction's chain.
    #[error("invalid savepoint: {message}")]
    InvalidSavepoint {
        /// Description of the problem.
        message: String,
    },

    /// The savepoint belongs to a different transaction.
    #[error("savepoint belongs to {owner}, not {transaction}")]
    ForeignSavepoint {
        /// Transaction that created the savepoint.
        owner: TransactionId,
        /// Transaction it was used with.
        transaction: TransactionId,
    },

    /// A change set was applied to a transaction with pending edits.
    #[error("cannot merge into a dirty transaction")]
    DirtyMerge,

    /// A delta was recorded against a different version than the local one.
    #[error("change set is outdated for {id}: expected {expected}, found {actual}")]
    ChangeSetOutdated {
        /// Affected object.
        id: ObjectId,
        /// Version the delta was recorded against.
        expected: Version,
        /// Version of the local object.
        actual: Version,
    },

    /// The object state machine rejected an event.
    #[error("illegal transition for {id}: {event:?} in state {state:?}")]
    IllegalTransition {
        /// Affected object.
        id: ObjectId,
        /// State the object was in.
        state: ObjectState,
        /// Rejected event.
        event: ObjectEvent,
    },

    /// A reference list contained something that is not a reference.
    #[error("list feature {feature} of {id} holds a non-reference element")]
    InvalidListElement {
        /// Affected object.
        id: ObjectId,
        /// Affected feature.
        feature: String,
    },

    /// The object is not registered with the transaction.
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    /// An object was registered twice in the same savepoint.
    #[error("{id} is already registered as {kind}")]
    DuplicateRegistration {
        /// Affected object.
        id: ObjectId,
        /// Which registration was repeated.
        kind: &'static str,
    },

    /// Commit refused while conflicts are unresolved.
    #[error("{count} conflicting objects must be resolved first")]
    ConflictsPending {
        /// Number of conflicting objects.
        count: usize,
    },

    /// A partial commit would leave references outside the committed set.
    #[error("integrity violation: {message}")]
    IntegrityViolation {
        /// Description of the first problem found.
        message: String,
        /// Objects that must be included in the commit.
        missing: Vec<ObjectId>,
    },

    /// A distributed commit failed in the given phase.
    #[error("XA phase {phase} failed for {transaction}: {source}")]
    Xa {
        /// Phase that failed (1, 2 or 3).
        phase: u8,
        /// Participant that failed.
        transaction: TransactionId,
        /// Underlying failure.
        #[source]
        source: Box<CoreError>,
    },

    /// A lock or unlock wait was interrupted.
    #[error("lock wait interrupted: {message}")]
    LockInterrupted {
        /// Description of the interruption.
        message: String,
    },

    /// Locks could not be acquired.
    #[error("lock not granted (timed out: {timed_out}, stale: {stale:?})")]
    LockNotGranted {
        /// Whether the wait timed out.
        timed_out: bool,
        /// Objects whose local revision was stale.
        stale: Vec<ObjectId>,
    },

    /// A change stream could not be decoded.
    #[error("invalid change stream: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// The transaction was closed.
    #[error("transaction is closed")]
    TransactionClosed,
}

impl CoreError {
    /// Creates an invalid savepoint error.
    pub fn invalid_savepoint(message: impl Into<String>) -> Self {
        Self::InvalidSavepoint {
            message: message.into(),
        }
    }

    /// Creates an integrity violation error.
    pub fn integrity_violation(message: impl Into<String>, missing: Vec<ObjectId>) -> Self {
        Self::IntegrityViolation {
            message: message.into(),
            missing,
        }
    }

    /// Wraps a participant failure in an XA error.
    pub fn xa(phase: u8, transaction: TransactionId, source: CoreError) -> Self {
        Self::Xa {
            phase,
            transaction,
            source: Box::new(source),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Translates a protocol error raised on the lock/unlock path.
    ///
    /// Interrupted waits become [`CoreError::LockInterrupted`]; everything
    /// else stays a protocol error.
    pub fn from_lock_error(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Interrupted(message) => Self::LockInterrupted { message },
            other => Self::Protocol(other),
        }
    }

    /// Returns the commit failure carried by this error, looking through XA
    /// wrappers.
    pub fn commit_failure(&self) -> Option<&CommitFailure> {
        match self {
            Self::Commit(failure) => Some(failure),
            Self::Xa { source, .. } => source.commit_failure(),
            _ => None,
        }
    }

    /// Returns true for failures raised before any network call.
    pub fn is_local_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidSavepoint { .. }
                | Self::ForeignSavepoint { .. }
                | Self::DirtyMerge
                | Self::ChangeSetOutdated { .. }
                | Self::IllegalTransition { .. }
                | Self::InvalidListElement { .. }
                | Self::ObjectNotFound(_)
                | Self::DuplicateRegistration { .. }
                | Self::ConflictsPending { .. }
                | Self::IntegrityViolation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revtx_model::BranchId;

    fn point() -> BranchPoint {
        BranchPoint::new(BranchId::MAIN, Timestamp::new(20))
    }

    #[test]
    fn plain_rejection_has_no_xrefs() {
        let result = CommitTransactionResult::rejected("stale", point(), Timestamp::new(10));
        let failure = CommitFailure::from_result(&result).unwrap();
        assert!(matches!(failure, CommitFailure::Rejected { .. }));
        assert_eq!(failure.message(), "stale");
        assert!(failure.xrefs().is_empty());
    }

    #[test]
    fn xrefs_mark_integrity_violation() {
        let xref = ObjectReference {
            source: ObjectId::permanent(1),
            feature: "owner".into(),
            target: ObjectId::permanent(2),
        };
        let result = CommitTransactionResult::rejected("dangling", point(), Timestamp::new(10))
            .with_xrefs(vec![xref.clone()]);
        let failure = CommitFailure::from_result(&result).unwrap();
        assert_eq!(failure.xrefs(), &[xref]);
        assert_eq!(failure.branch_point(), point());
    }

    #[test]
    fn success_is_not_a_failure() {
        let result = CommitTransactionResult::success(point(), Timestamp::new(10));
        assert!(CommitFailure::from_result(&result).is_none());
    }

    #[test]
    fn interrupted_lock_wait_is_distinct() {
        let err = CoreError::from_lock_error(ProtocolError::Interrupted("shutdown".into()));
        assert!(matches!(err, CoreError::LockInterrupted { .. }));
        let err = CoreError::from_lock_error(ProtocolError::Timeout);
        assert!(matches!(err, CoreError::Protocol(ProtocolError::Timeout)));
    }

    #[test]
    fn xa_error_exposes_commit_failure() {
        let result = CommitTransactionResult::rejected("no", point(), Timestamp::new(1));
        let inner = CoreError::Commit(CommitFailure::from_result(&result).unwrap());
        let err = CoreError::xa(1, TransactionId::new(3), inner);
        assert_eq!(err.commit_failure().map(CommitFailure::message), Some("no"));
        assert!(err.to_string().contains("phase 1"));
    }

    #[test]
    fn local_validation_classification() {
        assert!(CoreError::DirtyMerge.is_local_validation());
        assert!(CoreError::invalid_savepoint("gone").is_local_validation());
        assert!(!CoreError::Protocol(ProtocolError::Timeout).is_local_validation());
    }
}
