//! Transaction and XA configuration.

use crate::xa::{SequentialExecutor, XaExecutor};
use revtx_model::BranchId;
use revtx_protocol::{RetryConfig, SessionConfig};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How the pre-commit integrity check of a partial commit reports problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntegrityStyle {
    /// Stop at the first missing object.
    #[default]
    ExceptionFast,
    /// Collect every missing object before failing.
    Exception,
}

/// Configuration of a transaction.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Timeout sent with every commit request.
    pub commit_timeout: Duration,

    /// Release all locks after a full commit and after a rollback to the
    /// first savepoint.
    pub auto_release_locks: bool,

    /// Reporting style of the partial-commit integrity check.
    pub integrity_style: IntegrityStyle,

    /// Refuse to commit while conflicts are unresolved.
    pub reject_conflicting_commits: bool,

    /// Key locks by `(object, branch)` instead of by object alone.
    pub supports_branching: bool,

    /// Default timeout for lock requests.
    pub lock_timeout: Duration,

    /// Retry policy for idempotent loads.
    pub retry: RetryConfig,

    /// User recorded on commit infos produced by this transaction.
    pub user_id: String,

    /// Branch the transaction works on.
    pub branch: BranchId,

    /// Session the transaction's view belongs to; owner of locks taken on
    /// new objects.
    pub session_id: u32,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            commit_timeout: Duration::from_secs(30),
            auto_release_locks: true,
            integrity_style: IntegrityStyle::ExceptionFast,
            reject_conflicting_commits: true,
            supports_branching: true,
            lock_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            user_id: "anonymous".to_owned(),
            branch: BranchId::MAIN,
            session_id: 0,
        }
    }
}

impl TransactionConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the commit timeout.
    #[must_use]
    pub const fn commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    /// Sets whether locks are released automatically.
    #[must_use]
    pub const fn auto_release_locks(mut self, value: bool) -> Self {
        self.auto_release_locks = value;
        self
    }

    /// Sets the integrity check style.
    #[must_use]
    pub const fn integrity_style(mut self, style: IntegrityStyle) -> Self {
        self.integrity_style = style;
        self
    }

    /// Sets whether commits are refused while conflicts are pending.
    #[must_use]
    pub const fn reject_conflicting_commits(mut self, value: bool) -> Self {
        self.reject_conflicting_commits = value;
        self
    }

    /// Sets whether locks are keyed per branch.
    #[must_use]
    pub const fn supports_branching(mut self, value: bool) -> Self {
        self.supports_branching = value;
        self
    }

    /// Sets the default lock timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the retry policy for idempotent loads.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the committing user.
    #[must_use]
    pub fn user_id(mut self, user: impl Into<String>) -> Self {
        self.user_id = user.into();
        self
    }

    /// Sets the working branch.
    #[must_use]
    pub const fn branch(mut self, branch: BranchId) -> Self {
        self.branch = branch;
        self
    }

    /// Sets the owning session.
    #[must_use]
    pub const fn session_id(mut self, session_id: u32) -> Self {
        self.session_id = session_id;
        self
    }
}

impl From<&SessionConfig> for TransactionConfig {
    /// Takes over the session's user, lock timeout, branching mode and
    /// retry policy.
    fn from(session: &SessionConfig) -> Self {
        Self {
            commit_timeout: session.timeout,
            supports_branching: session.supports_branching,
            lock_timeout: session.lock_timeout,
            retry: session.retry.clone(),
            user_id: session.user_id.clone(),
            ..Self::default()
        }
    }
}

/// How the XA coordinator dispatches a phase to its participants.
#[derive(Clone, Default)]
pub enum XaExecutionMode {
    /// One participant at a time on the calling thread.
    #[default]
    Sequential,
    /// A caller-supplied executor. It must finish a phase for every
    /// participant before returning.
    Custom(Arc<dyn XaExecutor>),
}

impl fmt::Debug for XaExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => f.write_str("Sequential"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Configuration of an XA transaction.
#[derive(Debug, Clone, Default)]
pub struct XaConfig {
    /// Phase dispatch mode.
    pub execution: XaExecutionMode,
}

impl XaConfig {
    /// Creates a new configuration with the sequential executor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a custom executor.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn XaExecutor>) -> Self {
        self.execution = XaExecutionMode::Custom(executor);
        self
    }

    pub(crate) fn build_executor(&self) -> Arc<dyn XaExecutor> {
        match &self.execution {
            XaExecutionMode::Sequential => Arc::new(SequentialExecutor),
            XaExecutionMode::Custom(executor) => Arc::clone(executor),
        }
    }
}
