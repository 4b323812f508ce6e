//! # revtx Core
//!
//! Client-side transaction engine for a versioned object repository.
//!
//! This crate provides:
//! - [`Transaction`]: object edits recorded as savepointed change logs
//! - Rollback to any savepoint, with the remaining changes replayed
//! - [`CommitContext`]: the payload of a commit, optionally partial
//! - Remote invalidation and pluggable conflict resolution
//! - [`XaTransaction`]: three-phase commit across transactions
//! - Export and import of pending changes as a byte stream
//!
//! ## Savepoints
//!
//! Every transaction starts with one savepoint. Edits are recorded in the
//! last one; [`Transaction::set_savepoint`] starts a new one and
//! [`Transaction::rollback_to`] discards everything recorded after a given
//! savepoint. A commit sends the changes of all savepoints merged, then
//! resets the chain.
//!
//! ## Usage
//!
//! ```
//! use revtx_core::Transaction;
//! use revtx_model::{BranchId, BranchPoint, ClassInfo, FeatureInfo, ObjectId, Timestamp};
//! use revtx_protocol::{CommitTransactionResult, MockSession};
//! use std::sync::Arc;
//!
//! let session = Arc::new(MockSession::new());
//! let tx = Transaction::new(session.clone());
//! let class = Arc::new(ClassInfo::new("shop", "Order").with_feature(FeatureInfo::attribute("total")));
//!
//! let order = tx.new_object(class).unwrap();
//! tx.set(order, "total", 42i64).unwrap();
//!
//! session.set_commit_result(
//!     CommitTransactionResult::success(BranchPoint::new(BranchId::MAIN, Timestamp::new(10)), Timestamp::new(1))
//!         .with_mapping(order, ObjectId::permanent(7)),
//! );
//! let info = tx.commit().unwrap().unwrap();
//! assert_eq!(info.id_mappings[&order], ObjectId::permanent(7));
//! assert!(tx.object(ObjectId::permanent(7)).unwrap().is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod commit;
mod config;
mod error;
mod object;
mod package;
mod savepoint;
mod transaction;
mod types;
mod xa;

pub use commit::CommitContext;
pub use config::{IntegrityStyle, TransactionConfig, XaConfig, XaExecutionMode};
pub use error::{CommitFailure, CoreError, CoreResult};
pub use object::{ManagedObject, ObjectEvent, ObjectState, Transition};
pub use savepoint::{ChangeLog, SavepointChain, SavepointHandle};
pub use transaction::{
    ConflictResolver, ConflictSet, DefaultStrategy, ExportOptions, FinishKind, ObjectChange, ObjectEditor,
    RebaseResolver, TakeRemoteResolver, Transaction, TransactionEvent, TransactionHandler, TransactionListener,
    TransactionStrategy,
};
pub use types::{SavepointId, TransactionId};
pub use xa::{ParallelExecutor, SequentialExecutor, XaCommitContext, XaExecutor, XaState, XaTransaction};
