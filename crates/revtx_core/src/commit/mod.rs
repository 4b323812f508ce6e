//! Commit payloads and the partial-commit integrity check.

mod context;
pub(crate) mod integrity;

pub use context::CommitContext;
