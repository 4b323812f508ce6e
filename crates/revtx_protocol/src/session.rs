//! The session protocol abstraction.

use crate::config::RetryConfig;
use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::{
    CommitDelegationRequest, CommitRequest, CommitTransactionResult, LoadRevisionsRequest,
    LockObjectsRequest, LockObjectsResult, OpenSessionRequest, OpenSessionResult,
    UnlockObjectsRequest, UnlockObjectsResult, XaPhase2Request,
};
use crate::notification::NotificationHub;
use parking_lot::Mutex;
use revtx_model::{LobId, ObjectId, Revision, Timestamp};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// A connection to a versioned object repository.
///
/// Every call is a blocking round trip on the calling thread. Implementations
/// translate transport failures into [`ProtocolError`] and report commit
/// rejections as data in [`CommitTransactionResult`].
pub trait SessionProtocol: Send + Sync {
    /// Opens the session.
    fn open_session(&self, request: &OpenSessionRequest) -> ProtocolResult<OpenSessionResult>;

    /// Commits a single transaction.
    fn commit_transaction(&self, request: &CommitRequest) -> ProtocolResult<CommitTransactionResult>;

    /// Commits on behalf of another user.
    fn commit_delegation(
        &self,
        request: &CommitDelegationRequest,
    ) -> ProtocolResult<CommitTransactionResult>;

    /// XA phase 1: sends the payload and receives provisional ID mappings.
    fn commit_xa_phase1(&self, request: &CommitRequest) -> ProtocolResult<CommitTransactionResult>;

    /// XA phase 2: forwards cross-participant ID mappings and waits until the
    /// repository is ready to finalize.
    fn commit_xa_phase2(&self, request: &XaPhase2Request) -> ProtocolResult<()>;

    /// XA phase 3: makes the commit durable.
    fn commit_xa_phase3(&self, view_id: u32) -> ProtocolResult<()>;

    /// Aborts an XA commit that has not reached phase 3.
    fn commit_xa_cancel(&self, view_id: u32) -> ProtocolResult<()>;

    /// Acquires locks.
    ///
    /// An interrupted wait fails with [`ProtocolError::Interrupted`].
    fn lock_objects(&self, request: &LockObjectsRequest) -> ProtocolResult<LockObjectsResult>;

    /// Releases locks.
    fn unlock_objects(&self, request: &UnlockObjectsRequest) -> ProtocolResult<UnlockObjectsResult>;

    /// Loads revisions, plus prefetched ones according to depth and fetch rules.
    fn load_revisions(&self, request: &LoadRevisionsRequest) -> ProtocolResult<Vec<Revision>>;

    /// Returns the subset of `ids` the repository already stores.
    fn query_lobs(&self, ids: &[LobId]) -> ProtocolResult<Vec<LobId>>;

    /// Loads a lob payload.
    fn load_lob(&self, id: LobId) -> ProtocolResult<Vec<u8>>;

    /// The hub push notifications are delivered through.
    fn notifications(&self) -> &NotificationHub;
}

/// Runs an idempotent call, retrying retryable failures with backoff.
pub fn with_retry<T>(
    config: &RetryConfig,
    mut call: impl FnMut() -> ProtocolResult<T>,
) -> ProtocolResult<T> {
    let mut attempt = 0;
    loop {
        match call() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < config.max_attempts => {
                attempt += 1;
                let delay = config.delay_for_attempt(attempt);
                tracing::debug!(attempt, ?delay, error = %err, "retrying protocol call");
                std::thread::sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
}

/// A scripted session for unit tests.
///
/// Responses are set up front; every call is recorded by name.
#[derive(Debug)]
pub struct MockSession {
    connected: AtomicBool,
    commit_result: Mutex<Option<CommitTransactionResult>>,
    xa_phase1_result: Mutex<Option<CommitTransactionResult>>,
    xa_phase2_error: Mutex<Option<ProtocolError>>,
    lock_result: Mutex<Option<LockObjectsResult>>,
    revisions: Mutex<HashMap<ObjectId, Revision>>,
    known_lobs: Mutex<HashSet<LobId>>,
    calls: Mutex<Vec<String>>,
    last_commit: Mutex<Option<CommitRequest>>,
    hub: NotificationHub,
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSession {
    /// Creates a connected mock with no scripted responses.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            commit_result: Mutex::new(None),
            xa_phase1_result: Mutex::new(None),
            xa_phase2_error: Mutex::new(None),
            lock_result: Mutex::new(None),
            revisions: Mutex::new(HashMap::new()),
            known_lobs: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            last_commit: Mutex::new(None),
            hub: NotificationHub::new(),
        }
    }

    /// Sets the result of `commit_transaction` and `commit_delegation`.
    pub fn set_commit_result(&self, result: CommitTransactionResult) {
        *self.commit_result.lock() = Some(result);
    }

    /// Sets the result of `commit_xa_phase1`.
    pub fn set_xa_phase1_result(&self, result: CommitTransactionResult) {
        *self.xa_phase1_result.lock() = Some(result);
    }

    /// Makes `commit_xa_phase2` fail.
    pub fn fail_xa_phase2(&self, error: ProtocolError) {
        *self.xa_phase2_error.lock() = Some(error);
    }

    /// Sets the result of `lock_objects`.
    pub fn set_lock_result(&self, result: LockObjectsResult) {
        *self.lock_result.lock() = Some(result);
    }

    /// Makes a revision loadable.
    pub fn add_revision(&self, revision: Revision) {
        self.revisions.lock().insert(revision.id(), revision);
    }

    /// Marks a lob as already stored.
    pub fn add_known_lob(&self, id: LobId) {
        self.known_lobs.lock().insert(id);
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Returns the names of all calls so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Returns the last commit request received.
    pub fn last_commit(&self) -> Option<CommitRequest> {
        self.last_commit.lock().clone()
    }

    fn record(&self, call: &str) -> ProtocolResult<()> {
        self.calls.lock().push(call.to_owned());
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProtocolError::NotConnected)
        }
    }

    fn scripted<T: Clone>(slot: &Mutex<Option<T>>, call: &str) -> ProtocolResult<T> {
        slot.lock()
            .clone()
            .ok_or_else(|| ProtocolError::Remote(format!("no mock {call} response set")))
    }
}

impl SessionProtocol for MockSession {
    fn open_session(&self, _request: &OpenSessionRequest) -> ProtocolResult<OpenSessionResult> {
        self.record("open_session")?;
        Ok(OpenSessionResult {
            session_id: 1,
            repository_uuid: Uuid::nil(),
            supports_branching: true,
            last_update_time: Timestamp::UNSPECIFIED,
        })
    }

    fn commit_transaction(&self, request: &CommitRequest) -> ProtocolResult<CommitTransactionResult> {
        self.record("commit_transaction")?;
        *self.last_commit.lock() = Some(request.clone());
        Self::scripted(&self.commit_result, "commit")
    }

    fn commit_delegation(
        &self,
        _request: &CommitDelegationRequest,
    ) -> ProtocolResult<CommitTransactionResult> {
        self.record("commit_delegation")?;
        Self::scripted(&self.commit_result, "commit")
    }

    fn commit_xa_phase1(&self, request: &CommitRequest) -> ProtocolResult<CommitTransactionResult> {
        self.record("commit_xa_phase1")?;
        *self.last_commit.lock() = Some(request.clone());
        Self::scripted(&self.xa_phase1_result, "xa phase 1")
    }

    fn commit_xa_phase2(&self, _request: &XaPhase2Request) -> ProtocolResult<()> {
        self.record("commit_xa_phase2")?;
        match self.xa_phase2_error.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn commit_xa_phase3(&self, _view_id: u32) -> ProtocolResult<()> {
        self.record("commit_xa_phase3")
    }

    fn commit_xa_cancel(&self, _view_id: u32) -> ProtocolResult<()> {
        self.record("commit_xa_cancel")
    }

    fn lock_objects(&self, _request: &LockObjectsRequest) -> ProtocolResult<LockObjectsResult> {
        self.record("lock_objects")?;
        Self::scripted(&self.lock_result, "lock")
    }

    fn unlock_objects(&self, _request: &UnlockObjectsRequest) -> ProtocolResult<UnlockObjectsResult> {
        self.record("unlock_objects")?;
        Ok(UnlockObjectsResult {
            new_lock_states: Vec::new(),
            timestamp: Timestamp::UNSPECIFIED,
        })
    }

    fn load_revisions(&self, request: &LoadRevisionsRequest) -> ProtocolResult<Vec<Revision>> {
        self.record("load_revisions")?;
        let revisions = self.revisions.lock();
        Ok(request
            .ids
            .iter()
            .filter_map(|id| revisions.get(id).cloned())
            .collect())
    }

    fn query_lobs(&self, ids: &[LobId]) -> ProtocolResult<Vec<LobId>> {
        self.record("query_lobs")?;
        let known = self.known_lobs.lock();
        Ok(ids.iter().filter(|id| known.contains(id)).copied().collect())
    }

    fn load_lob(&self, id: LobId) -> ProtocolResult<Vec<u8>> {
        self.record("load_lob")?;
        Err(ProtocolError::Remote(format!("lob {id} not found")))
    }

    fn notifications(&self) -> &NotificationHub {
        &self.hub
    }
}
