//! Fault injection around a session.
//!
//! [`FaultySession`] forwards every call to an inner session unless a fault
//! has been scripted for that call kind. Faults are consumed in the order
//! they were added.

use parking_lot::Mutex;
use revtx_model::{BranchId, BranchPoint, LobId, Revision, Timestamp};
use revtx_protocol::{
    CommitDelegationRequest, CommitRequest, CommitTransactionResult, LoadRevisionsRequest,
    LockObjectsRequest, LockObjectsResult, NotificationHub, OpenSessionRequest, OpenSessionResult,
    ProtocolError, ProtocolResult, SessionProtocol, UnlockObjectsRequest, UnlockObjectsResult,
    XaPhase2Request,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// The protocol calls a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    /// `open_session`
    Open,
    /// `commit_transaction` and `commit_delegation`
    Commit,
    /// `commit_xa_phase1`
    XaPhase1,
    /// `commit_xa_phase2`
    XaPhase2,
    /// `commit_xa_phase3`
    XaPhase3,
    /// `commit_xa_cancel`
    XaCancel,
    /// `lock_objects`
    Lock,
    /// `unlock_objects`
    Unlock,
    /// `load_revisions`
    Load,
    /// `query_lobs` and `load_lob`
    Lobs,
}

/// What happens to one scripted call.
#[derive(Debug, Clone)]
pub enum Fault {
    /// The call fails without reaching the inner session.
    Fail(ProtocolError),
    /// A commit call comes back rejected without reaching the inner session;
    /// other calls fail with [`ProtocolError::Remote`].
    Reject(String),
    /// The call is forwarded after sleeping.
    Delay(Duration),
}

/// A session wrapper that injects scripted failures, rejections and delays.
pub struct FaultySession {
    inner: Arc<dyn SessionProtocol>,
    faults: Mutex<HashMap<Call, VecDeque<Fault>>>,
    counts: Mutex<HashMap<Call, usize>>,
}

impl std::fmt::Debug for FaultySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultySession")
            .field("pending", &self.faults.lock().values().map(VecDeque::len).sum::<usize>())
            .finish_non_exhaustive()
    }
}

impl FaultySession {
    /// Wraps `inner` without any fault.
    pub fn new(inner: Arc<dyn SessionProtocol>) -> Self {
        Self {
            inner,
            faults: Mutex::new(HashMap::new()),
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Queues a fault for the next `call`.
    pub fn inject(&self, call: Call, fault: Fault) -> &Self {
        self.faults.lock().entry(call).or_default().push_back(fault);
        self
    }

    /// Makes the next `call` fail with `error`.
    pub fn fail(&self, call: Call, error: ProtocolError) -> &Self {
        self.inject(call, Fault::Fail(error))
    }

    /// Makes the next `times` calls of `call` fail with `error`.
    pub fn fail_times(&self, call: Call, times: usize, error: ProtocolError) -> &Self {
        for _ in 0..times {
            self.fail(call, error.clone());
        }
        self
    }

    /// Makes the next commit-like `call` come back rejected.
    pub fn reject(&self, call: Call, message: impl Into<String>) -> &Self {
        self.inject(call, Fault::Reject(message.into()))
    }

    /// Delays the next `call`.
    pub fn delay(&self, call: Call, delay: Duration) -> &Self {
        self.inject(call, Fault::Delay(delay))
    }

    /// Drops every fault not consumed yet.
    pub fn clear(&self) {
        self.faults.lock().clear();
    }

    /// Number of times `call` was attempted, faulted or not.
    #[must_use]
    pub fn count(&self, call: Call) -> usize {
        self.counts.lock().get(&call).copied().unwrap_or(0)
    }

    /// Counts the call and applies its next fault, if any.
    ///
    /// Returns the fault that replaces the call; delays are served here.
    fn enter(&self, call: Call) -> Option<Fault> {
        *self.counts.lock().entry(call).or_default() += 1;
        let fault = self.faults.lock().get_mut(&call).and_then(VecDeque::pop_front)?;
        debug!(?call, ?fault, "injecting fault");
        match fault {
            Fault::Delay(delay) => {
                std::thread::sleep(delay);
                None
            }
            other => Some(other),
        }
    }

    fn guard(&self, call: Call) -> ProtocolResult<()> {
        match self.enter(call) {
            Some(Fault::Fail(err)) => Err(err),
            Some(Fault::Reject(message)) => Err(ProtocolError::Remote(message)),
            Some(Fault::Delay(_)) | None => Ok(()),
        }
    }

    fn commit_with(
        &self,
        call: Call,
        branch: BranchId,
        forward: impl FnOnce() -> ProtocolResult<CommitTransactionResult>,
    ) -> ProtocolResult<CommitTransactionResult> {
        match self.enter(call) {
            Some(Fault::Fail(err)) => Err(err),
            Some(Fault::Reject(message)) => Ok(CommitTransactionResult::rejected(
                message,
                BranchPoint::head(branch),
                Timestamp::UNSPECIFIED,
            )),
            Some(Fault::Delay(_)) | None => forward(),
        }
    }
}

impl SessionProtocol for FaultySession {
    fn open_session(&self, request: &OpenSessionRequest) -> ProtocolResult<OpenSessionResult> {
        self.guard(Call::Open)?;
        self.inner.open_session(request)
    }

    fn commit_transaction(&self, request: &CommitRequest) -> ProtocolResult<CommitTransactionResult> {
        self.commit_with(Call::Commit, request.branch, || self.inner.commit_transaction(request))
    }

    fn commit_delegation(&self, request: &CommitDelegationRequest) -> ProtocolResult<CommitTransactionResult> {
        self.commit_with(Call::Commit, request.branch, || self.inner.commit_delegation(request))
    }

    fn commit_xa_phase1(&self, request: &CommitRequest) -> ProtocolResult<CommitTransactionResult> {
        self.commit_with(Call::XaPhase1, request.branch, || self.inner.commit_xa_phase1(request))
    }

    fn commit_xa_phase2(&self, request: &XaPhase2Request) -> ProtocolResult<()> {
        self.guard(Call::XaPhase2)?;
        self.inner.commit_xa_phase2(request)
    }

    fn commit_xa_phase3(&self, view_id: u32) -> ProtocolResult<()> {
        self.guard(Call::XaPhase3)?;
        self.inner.commit_xa_phase3(view_id)
    }

    fn commit_xa_cancel(&self, view_id: u32) -> ProtocolResult<()> {
        self.guard(Call::XaCancel)?;
        self.inner.commit_xa_cancel(view_id)
    }

    fn lock_objects(&self, request: &LockObjectsRequest) -> ProtocolResult<LockObjectsResult> {
        self.guard(Call::Lock)?;
        self.inner.lock_objects(request)
    }

    fn unlock_objects(&self, request: &UnlockObjectsRequest) -> ProtocolResult<UnlockObjectsResult> {
        self.guard(Call::Unlock)?;
        self.inner.unlock_objects(request)
    }

    fn load_revisions(&self, request: &LoadRevisionsRequest) -> ProtocolResult<Vec<Revision>> {
        self.guard(Call::Load)?;
        self.inner.load_revisions(request)
    }

    fn query_lobs(&self, ids: &[LobId]) -> ProtocolResult<Vec<LobId>> {
        self.guard(Call::Lobs)?;
        self.inner.query_lobs(ids)
    }

    fn load_lob(&self, id: LobId) -> ProtocolResult<Vec<u8>> {
        self.guard(Call::Lobs)?;
        self.inner.load_lob(id)
    }

    fn notifications(&self) -> &NotificationHub {
        self.inner.notifications()
    }
}
