//! Savepoints: ordered checkpoints of pending mutations.
//!
//! A transaction owns one [`SavepointChain`]. Every edit is recorded in the
//! last savepoint's [`ChangeLog`]; the cumulative getters on
//! `SavepointChain<ChangeLog>` walk the chain first to last to produce the
//! change set a commit sends. Rolling back to a savepoint empties it and
//! discards every later one.

mod chain;
mod change_log;

pub use chain::{SavepointChain, SavepointHandle};
pub use change_log::ChangeLog;
