//! An in-memory repository that speaks the session protocol.
//!
//! Good enough to run transactions end to end in tests: it assigns
//! permanent IDs, checks versions, holds locks, prepares XA commits and
//! pushes commit notifications to the other open sessions. Nothing is
//! persisted; branches are independent key spaces without inheritance.

use parking_lot::{Condvar, Mutex};
use revtx_model::{
    BranchId, BranchPoint, ChangeSetData, IdAndVersion, IdMapper, Lob, LobId, LockOwner, LockState,
    LockTarget, LockType, ObjectId, Revision, Timestamp, Version,
};
use revtx_protocol::{
    CommitData, CommitDelegationRequest, CommitInfo, CommitRequest, CommitTransactionResult,
    LoadRevisionsRequest, LockChangeInfo, LockObjectsRequest, LockObjectsResult, LockOperation,
    NotificationHub, OpenSessionRequest, OpenSessionResult, ProtocolError, ProtocolResult,
    RemoteSessionEvent, SessionNotification, SessionProtocol, UnlockObjectsRequest,
    UnlockObjectsResult, XaPhase2Request,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Repository state guarded by one mutex.
#[derive(Default)]
struct Store {
    revisions: HashMap<(BranchId, ObjectId), Revision>,
    lobs: HashMap<LobId, Vec<u8>>,
    locks: HashMap<LockTarget, LockState>,
    packages: HashSet<String>,
    prepared: HashMap<(u32, u32), Prepared>,
    heads: HashMap<BranchId, Timestamp>,
    next_id: u64,
    clock: i64,
}

/// An XA commit that passed phase 1.
struct Prepared {
    request: CommitRequest,
    owner: LockOwner,
    point: BranchPoint,
    previous: Timestamp,
    mappings: HashMap<ObjectId, ObjectId>,
    foreign: HashMap<ObjectId, ObjectId>,
    held: Vec<LockTarget>,
}

/// Who a commit is attributed to.
#[derive(Clone, Copy)]
struct Committer<'a> {
    id: u32,
    user_id: &'a str,
}

/// Everything a successful commit needs to tell the world.
struct Applied {
    result: CommitTransactionResult,
    info: CommitInfo,
}

impl Store {
    fn tick(&mut self) -> Timestamp {
        self.clock += 1;
        Timestamp::new(self.clock)
    }

    fn head(&self, branch: BranchId) -> Timestamp {
        self.heads.get(&branch).copied().unwrap_or_default()
    }

    fn assign_ids(&mut self, data: &CommitData) -> HashMap<ObjectId, ObjectId> {
        let mut mappings = HashMap::new();
        for revision in &data.new_objects {
            if revision.id().is_temporary() {
                self.next_id += 1;
                mappings.insert(revision.id(), ObjectId::permanent(self.next_id));
            }
        }
        mappings
    }

    /// Returns the rollback message if `data` cannot be committed by `owner`.
    fn validate(&self, branch: BranchId, data: &CommitData, owner: Option<&LockOwner>, branching: bool) -> Option<String> {
        let touched = data
            .changed_objects
            .iter()
            .map(|d| IdAndVersion::new(d.id(), d.version()))
            .chain(data.detached_objects.iter().copied());
        for target in touched {
            let Some(stored) = self.revisions.get(&(branch, target.id)) else {
                return Some(format!("object {} does not exist", target.id));
            };
            if target.version.is_specified() && stored.version() != target.version {
                return Some(format!(
                    "attempt to modify historical revision {} {} (current {})",
                    target.id,
                    target.version,
                    stored.version()
                ));
            }
            let key = LockTarget::for_object(target.id, branch, branching);
            if let Some(lock) = self.locks.get(&key) {
                let blocked = match owner {
                    Some(owner) => lock.is_locked_by_others(LockType::Write, owner),
                    None => lock.write_owner().is_some(),
                };
                if blocked {
                    return Some(format!("object {} is write-locked by another view", target.id));
                }
            }
        }
        None
    }

    /// Writes `data` and returns the committed change set with permanent IDs.
    fn apply(
        &mut self,
        branch: BranchId,
        point: BranchPoint,
        data: &CommitData,
        lobs: &[Lob],
        mapper: &IdMapper,
    ) -> ProtocolResult<ChangeSetData> {
        let mut new_objects = Vec::with_capacity(data.new_objects.len());
        for revision in &data.new_objects {
            let mut revision = revision.clone();
            revision.set_id(mapper.get(revision.id()).unwrap_or(revision.id()));
            revision.adjust_references(mapper);
            revision.set_version(Version::FIRST);
            revision.set_branch_point(point);
            self.revisions.insert((branch, revision.id()), revision.clone());
            new_objects.push(revision);
        }

        let mut changed_objects = Vec::with_capacity(data.changed_objects.len());
        for delta in &data.changed_objects {
            let mut delta = delta.clone();
            delta.adjust_references(mapper);
            let key = (branch, delta.id());
            let mut revision = self
                .revisions
                .get(&key)
                .cloned()
                .ok_or_else(|| ProtocolError::Remote(format!("object {} vanished", delta.id())))?;
            delta
                .apply(&mut revision)
                .map_err(|err| ProtocolError::Remote(err.to_string()))?;
            revision.set_version(delta.version().next());
            revision.set_branch_point(point);
            self.revisions.insert(key, revision);
            changed_objects.push(delta);
        }

        for detached in &data.detached_objects {
            self.revisions.remove(&(branch, detached.id));
            self.locks.retain(|target, _| target.id() != detached.id);
        }
        for package in &data.new_package_units {
            self.packages.insert(package.uri.clone());
        }
        for lob in lobs {
            self.lobs.insert(lob.id(), lob.data.clone());
        }

        self.heads.insert(branch, point.timestamp);
        Ok(ChangeSetData::new(
            new_objects,
            changed_objects,
            data.detached_objects.clone(),
        ))
    }

    /// Applies the lock part of a commit; returns the states to report back.
    fn commit_locks(&mut self, request: &CommitRequest, owner: &LockOwner, mapper: &IdMapper) -> Vec<LockState> {
        if request.release_locks {
            return self.release(owner, None, None);
        }
        let mut states = Vec::new();
        for lock in &request.locks_on_new_objects {
            let mut lock = lock.clone();
            lock.adjust_target(mapper);
            self.locks.insert(lock.target(), lock.clone());
            states.push(lock);
        }
        states
    }

    /// Releases locks of `owner`; returns the states that changed.
    fn release(&mut self, owner: &LockOwner, ids: Option<&[ObjectId]>, lock_type: Option<LockType>) -> Vec<LockState> {
        let mut changed = Vec::new();
        for (target, lock) in &mut self.locks {
            if ids.is_some_and(|ids| !ids.contains(&target.id())) {
                continue;
            }
            let released = match lock_type {
                Some(lock_type) => lock.remove_owner(lock_type, owner),
                None => lock.remove_all(owner),
            };
            if released {
                changed.push(lock.clone());
            }
        }
        self.locks.retain(|_, lock| !lock.is_unlocked());
        changed
    }

    fn release_targets(&mut self, owner: &LockOwner, targets: &[LockTarget]) {
        for target in targets {
            if let Some(lock) = self.locks.get_mut(target) {
                lock.remove_owner(LockType::Write, owner);
            }
        }
        self.locks.retain(|_, lock| !lock.is_unlocked());
    }

    /// Objects contained in `root`, transitively.
    fn contents_of(&self, branch: BranchId, root: ObjectId) -> Vec<ObjectId> {
        let mut found = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(parent) = queue.pop_front() {
            for ((b, id), revision) in &self.revisions {
                if *b == branch && revision.container_or_resource() == Some(parent) && !found.contains(id) {
                    found.push(*id);
                    queue.push_back(*id);
                }
            }
        }
        found
    }
}

/// A shared in-memory repository.
pub struct InMemoryRepository {
    name: String,
    uuid: Uuid,
    supports_branching: bool,
    store: Mutex<Store>,
    locks_released: Condvar,
    sessions: Mutex<Vec<Weak<RepositorySession>>>,
    next_session: AtomicU32,
}

impl std::fmt::Debug for InMemoryRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRepository")
            .field("name", &self.name)
            .field("objects", &self.object_count())
            .finish_non_exhaustive()
    }
}

impl InMemoryRepository {
    /// Creates an empty repository with branching support.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_branching(name, true)
    }

    /// Creates an empty repository.
    pub fn with_branching(name: impl Into<String>, supports_branching: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            uuid: Uuid::new_v4(),
            supports_branching,
            store: Mutex::new(Store::default()),
            locks_released: Condvar::new(),
            sessions: Mutex::new(Vec::new()),
            next_session: AtomicU32::new(1),
        })
    }

    /// Repository name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opens a session for `user_id`.
    pub fn open_session(self: &Arc<Self>, user_id: impl Into<String>) -> Arc<RepositorySession> {
        let session = Arc::new(RepositorySession {
            id: self.next_session.fetch_add(1, Ordering::SeqCst),
            user_id: user_id.into(),
            repository: Arc::clone(self),
            hub: NotificationHub::new(),
            open: AtomicBool::new(true),
        });
        self.sessions.lock().push(Arc::downgrade(&session));
        self.broadcast(
            session.id,
            &SessionNotification::RemoteSession(RemoteSessionEvent::Opened {
                session_id: session.id,
                user_id: session.user_id.clone(),
            }),
        );
        debug!(repository = %self.name, session = session.id, "session opened");
        session
    }

    /// Stores `revision` as committed state, bypassing the protocol.
    ///
    /// Temporary IDs are replaced; returns the stored revision.
    pub fn seed(&self, mut revision: Revision) -> Revision {
        let mut store = self.store.lock();
        if revision.id().is_temporary() {
            store.next_id += 1;
            revision.set_id(ObjectId::permanent(store.next_id));
        } else if let Some(value) = permanent_value(revision.id()) {
            store.next_id = store.next_id.max(value);
        }
        let point = BranchPoint::new(revision.branch(), store.tick());
        revision.set_version(Version::FIRST);
        revision.set_branch_point(point);
        store.heads.insert(point.branch, point.timestamp);
        store.revisions.insert((revision.branch(), revision.id()), revision.clone());
        revision
    }

    /// Returns the committed revision of `id` on the main branch.
    #[must_use]
    pub fn revision(&self, id: ObjectId) -> Option<Revision> {
        self.revision_on(BranchId::MAIN, id)
    }

    /// Returns the committed revision of `id` on `branch`.
    #[must_use]
    pub fn revision_on(&self, branch: BranchId, id: ObjectId) -> Option<Revision> {
        self.store.lock().revisions.get(&(branch, id)).cloned()
    }

    /// Number of committed objects across all branches.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.store.lock().revisions.len()
    }

    /// Current lock state of `id` on the main branch.
    #[must_use]
    pub fn lock_state(&self, id: ObjectId) -> Option<LockState> {
        let key = LockTarget::for_object(id, BranchId::MAIN, self.supports_branching);
        self.store.lock().locks.get(&key).cloned()
    }

    /// Returns true if an XA commit of `(session, view)` is prepared.
    #[must_use]
    pub fn is_prepared(&self, session_id: u32, view_id: u32) -> bool {
        self.store.lock().prepared.contains_key(&(session_id, view_id))
    }

    /// Returns true if the lob payload is stored.
    #[must_use]
    pub fn has_lob(&self, id: LobId) -> bool {
        self.store.lock().lobs.contains_key(&id)
    }

    /// Time of the last commit on `branch`.
    #[must_use]
    pub fn head(&self, branch: BranchId) -> Timestamp {
        self.store.lock().head(branch)
    }

    fn broadcast(&self, from: u32, notification: &SessionNotification) {
        let sessions: Vec<Arc<RepositorySession>> = {
            let mut sessions = self.sessions.lock();
            sessions.retain(|s| s.strong_count() > 0);
            sessions.iter().filter_map(Weak::upgrade).collect()
        };
        for session in sessions.iter().filter(|s| s.id != from && s.is_open()) {
            session.hub.publish(notification);
        }
    }

    fn commit(&self, session: Committer<'_>, request: &CommitRequest) -> CommitTransactionResult {
        let owner = LockOwner::new(session.id, request.view_id);
        let applied = {
            let mut store = self.store.lock();
            let previous = store.head(request.branch);
            if let Some(message) = store.validate(request.branch, &request.data, Some(&owner), self.supports_branching) {
                let point = BranchPoint::new(request.branch, store.tick());
                info!(repository = %self.name, session = session.id, view = request.view_id, %message, "commit rejected");
                return CommitTransactionResult::rejected(message, point, previous);
            }
            let point = BranchPoint::new(request.branch, store.tick());
            let mappings = store.assign_ids(&request.data);
            let mapper = IdMapper::from_mappings(mappings.clone());
            match self.finish(&mut store, session, request, &owner, point, previous, mappings, &mapper) {
                Ok(applied) => applied,
                Err(err) => {
                    warn!(repository = %self.name, error = %err, "commit failed while applying");
                    return CommitTransactionResult::rejected(err.to_string(), point, previous);
                }
            }
        };
        self.locks_released.notify_all();
        self.broadcast(session.id, &SessionNotification::Commit(applied.info));
        applied.result
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        store: &mut Store,
        session: Committer<'_>,
        request: &CommitRequest,
        owner: &LockOwner,
        point: BranchPoint,
        previous: Timestamp,
        mappings: HashMap<ObjectId, ObjectId>,
        mapper: &IdMapper,
    ) -> ProtocolResult<Applied> {
        let change_set = store.apply(request.branch, point, &request.data, &request.lobs, mapper)?;
        let new_lock_states = store.commit_locks(request, owner, mapper);
        info!(
            repository = %self.name,
            session = session.id,
            view = request.view_id,
            timestamp = point.timestamp.as_millis(),
            objects = change_set.len(),
            "commit applied"
        );
        let mut result = CommitTransactionResult::success(point, previous);
        result.id_mappings = mappings;
        result.new_lock_states = new_lock_states;
        Ok(Applied {
            result,
            info: CommitInfo {
                branch_point: point,
                previous_timestamp: previous,
                user_id: session.user_id.to_owned(),
                comment: request.comment.clone(),
                change_set,
                id_mappings: HashMap::new(),
            },
        })
    }

    fn prepare(&self, session: &RepositorySession, request: &CommitRequest) -> CommitTransactionResult {
        let owner = LockOwner::new(session.id, request.view_id);
        let mut store = self.store.lock();
        let previous = store.head(request.branch);
        let point = BranchPoint::new(request.branch, store.tick());
        if let Some(message) = store.validate(request.branch, &request.data, Some(&owner), self.supports_branching) {
            return CommitTransactionResult::rejected(message, point, previous);
        }

        let mut held = Vec::new();
        let touched = request
            .data
            .changed_objects
            .iter()
            .map(|d| d.id())
            .chain(request.data.detached_objects.iter().map(|d| d.id));
        for id in touched {
            let target = LockTarget::for_object(id, request.branch, self.supports_branching);
            let lock = store.locks.entry(target).or_insert_with(|| LockState::new(target));
            if lock.add_owner(LockType::Write, owner.clone()) {
                held.push(target);
            }
        }

        let mappings = store.assign_ids(&request.data);
        let mut result = CommitTransactionResult::success(point, previous);
        result.id_mappings = mappings.clone();
        store.prepared.insert(
            (session.id, request.view_id),
            Prepared {
                request: request.clone(),
                owner,
                point,
                previous,
                mappings,
                foreign: HashMap::new(),
                held,
            },
        );
        debug!(repository = %self.name, session = session.id, view = request.view_id, "xa commit prepared");
        result
    }

    fn finalize(&self, session: &RepositorySession, view_id: u32) -> ProtocolResult<()> {
        let info = {
            let mut store = self.store.lock();
            let prepared = store
                .prepared
                .remove(&(session.id, view_id))
                .ok_or_else(|| ProtocolError::Remote(format!("no prepared commit for view {view_id}")))?;
            let mut mapper = IdMapper::from_mappings(prepared.mappings.clone());
            for (from, to) in &prepared.foreign {
                mapper.insert(*from, *to);
            }
            store.release_targets(&prepared.owner, &prepared.held);
            let applied = self.finish(
                &mut store,
                session.committer(),
                &prepared.request,
                &prepared.owner,
                prepared.point,
                prepared.previous,
                prepared.mappings.clone(),
                &mapper,
            )?;
            applied.info
        };
        self.locks_released.notify_all();
        self.broadcast(session.id, &SessionNotification::Commit(info));
        Ok(())
    }

    fn lock(&self, session: &RepositorySession, request: &LockObjectsRequest) -> ProtocolResult<LockObjectsResult> {
        let owner = LockOwner::new(session.id, request.view_id);
        let branch = request.branch_point.branch;
        let deadline = Instant::now() + request.timeout;
        let mut store = self.store.lock();
        loop {
            let stale: Vec<IdAndVersion> = request
                .targets
                .iter()
                .filter(|t| {
                    t.version.is_specified()
                        && store
                            .revisions
                            .get(&(branch, t.id))
                            .is_some_and(|r| r.version() != t.version)
                })
                .copied()
                .collect();
            if !stale.is_empty() {
                return Ok(LockObjectsResult::stale(stale));
            }

            let mut ids = Vec::new();
            for target in &request.targets {
                if !store.revisions.contains_key(&(branch, target.id)) {
                    return Err(ProtocolError::Remote(format!("object {} does not exist", target.id)));
                }
                ids.push(target.id);
                if request.recursive {
                    ids.extend(store.contents_of(branch, target.id));
                }
            }
            let keys: Vec<LockTarget> = ids
                .iter()
                .map(|id| LockTarget::for_object(*id, branch, self.supports_branching))
                .collect();
            let free = keys.iter().all(|key| {
                store
                    .locks
                    .get(key)
                    .map_or(true, |lock| lock.can_lock(request.lock_type, &owner))
            });
            if free {
                let mut states = Vec::with_capacity(keys.len());
                for key in keys {
                    let lock = store.locks.entry(key).or_insert_with(|| LockState::new(key));
                    lock.add_owner(request.lock_type, owner.clone());
                    states.push(lock.clone());
                }
                let timestamp = store.tick();
                drop(store);
                self.broadcast(
                    session.id,
                    &SessionNotification::LockChanged(LockChangeInfo {
                        timestamp,
                        owner,
                        operation: LockOperation::Lock,
                        lock_type: request.lock_type,
                        lock_states: states.clone(),
                    }),
                );
                return Ok(LockObjectsResult::granted(states, timestamp));
            }

            if self.locks_released.wait_until(&mut store, deadline).timed_out() {
                debug!(repository = %self.name, session = session.id, view = request.view_id, "lock wait timed out");
                return Ok(LockObjectsResult::timed_out());
            }
        }
    }

    fn unlock(&self, session: &RepositorySession, request: &UnlockObjectsRequest) -> UnlockObjectsResult {
        let owner = LockOwner::new(session.id, request.view_id);
        let (states, timestamp) = {
            let mut store = self.store.lock();
            let ids = match (&request.targets, request.recursive) {
                (Some(targets), true) => {
                    let mut ids = targets.clone();
                    for target in targets {
                        ids.extend(store.contents_of(BranchId::MAIN, *target));
                    }
                    Some(ids)
                }
                (targets, _) => targets.clone(),
            };
            let states = store.release(&owner, ids.as_deref(), request.lock_type);
            (states, store.tick())
        };
        self.locks_released.notify_all();
        if !states.is_empty() {
            self.broadcast(
                session.id,
                &SessionNotification::LockChanged(LockChangeInfo {
                    timestamp,
                    owner,
                    operation: LockOperation::Unlock,
                    lock_type: request.lock_type.unwrap_or(LockType::Write),
                    lock_states: states.clone(),
                }),
            );
        }
        UnlockObjectsResult {
            new_lock_states: states,
            timestamp,
        }
    }

    fn load(&self, request: &LoadRevisionsRequest) -> Vec<Revision> {
        let branch = request.branch_point.branch;
        let store = self.store.lock();
        let mut seen = HashSet::new();
        let mut loaded = Vec::new();
        let mut frontier: Vec<ObjectId> = request.ids.clone();
        for depth in 0..=request.prefetch_depth {
            let mut next = Vec::new();
            for id in frontier {
                if !seen.insert(id) {
                    continue;
                }
                let Some(revision) = store.revisions.get(&(branch, id)) else {
                    continue;
                };
                if depth < request.prefetch_depth {
                    let class = revision.class().qualified_name();
                    let rule = request.fetch_rules.iter().find(|r| r.class == class);
                    revision.for_each_reference(|feature, target| {
                        if rule.map_or(true, |r| r.features.iter().any(|f| f == feature)) {
                            next.push(target);
                        }
                    });
                }
                loaded.push(revision.clone());
            }
            frontier = next;
        }
        loaded
    }

    fn close_session(&self, session: &RepositorySession) {
        {
            let mut store = self.store.lock();
            store.prepared.retain(|(s, _), _| *s != session.id);
            let owners: HashSet<LockOwner> = store
                .locks
                .values()
                .flat_map(|lock| {
                    lock.read_owners()
                        .iter()
                        .chain(lock.write_owner())
                        .chain(lock.write_option_owner())
                        .filter(|o| o.session_id == session.id)
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .collect();
            for owner in &owners {
                store.release(owner, None, None);
            }
        }
        self.locks_released.notify_all();
        self.broadcast(
            session.id,
            &SessionNotification::RemoteSession(RemoteSessionEvent::Closed {
                session_id: session.id,
            }),
        );
    }
}

fn permanent_value(id: ObjectId) -> Option<u64> {
    match id {
        ObjectId::Permanent(value) => Some(value),
        ObjectId::Temp(_) => None,
    }
}

/// One client connection to an [`InMemoryRepository`].
pub struct RepositorySession {
    id: u32,
    user_id: String,
    repository: Arc<InMemoryRepository>,
    hub: NotificationHub,
    open: AtomicBool,
}

impl std::fmt::Debug for RepositorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositorySession")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl RepositorySession {
    /// Session number; use it as the transaction's lock-owner session.
    #[must_use]
    pub fn session_id(&self) -> u32 {
        self.id
    }

    /// The repository this session is connected to.
    #[must_use]
    pub fn repository(&self) -> &Arc<InMemoryRepository> {
        &self.repository
    }

    /// Returns true until [`close`](Self::close) is called.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Closes the session, dropping its locks and prepared commits.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.repository.close_session(self);
        }
    }

    fn committer(&self) -> Committer<'_> {
        Committer {
            id: self.id,
            user_id: &self.user_id,
        }
    }

    fn check_open(&self) -> ProtocolResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ProtocolError::NotConnected)
        }
    }
}

impl SessionProtocol for RepositorySession {
    fn open_session(&self, request: &OpenSessionRequest) -> ProtocolResult<OpenSessionResult> {
        self.check_open()?;
        if request.repository_name != self.repository.name {
            return Err(ProtocolError::Remote(format!(
                "repository {} not found",
                request.repository_name
            )));
        }
        Ok(OpenSessionResult {
            session_id: self.id,
            repository_uuid: self.repository.uuid,
            supports_branching: self.repository.supports_branching,
            last_update_time: self.repository.head(BranchId::MAIN),
        })
    }

    fn commit_transaction(&self, request: &CommitRequest) -> ProtocolResult<CommitTransactionResult> {
        self.check_open()?;
        Ok(self.repository.commit(self.committer(), request))
    }

    fn commit_delegation(&self, request: &CommitDelegationRequest) -> ProtocolResult<CommitTransactionResult> {
        self.check_open()?;
        let delegate = Committer {
            id: self.id,
            user_id: &request.user_id,
        };
        let commit = CommitRequest {
            view_id: 0,
            branch: request.branch,
            comment: request.comment.clone(),
            release_locks: false,
            partial: false,
            data: request.data.clone(),
            locks_on_new_objects: Vec::new(),
            lobs: request.lobs.clone(),
            timeout: Duration::ZERO,
        };
        Ok(self.repository.commit(delegate, &commit))
    }

    fn commit_xa_phase1(&self, request: &CommitRequest) -> ProtocolResult<CommitTransactionResult> {
        self.check_open()?;
        Ok(self.repository.prepare(self, request))
    }

    fn commit_xa_phase2(&self, request: &XaPhase2Request) -> ProtocolResult<()> {
        self.check_open()?;
        let mut store = self.repository.store.lock();
        let prepared = store
            .prepared
            .get_mut(&(self.id, request.view_id))
            .ok_or_else(|| ProtocolError::Remote(format!("no prepared commit for view {}", request.view_id)))?;
        prepared.foreign.extend(request.id_mappings.iter().map(|(k, v)| (*k, *v)));
        Ok(())
    }

    fn commit_xa_phase3(&self, view_id: u32) -> ProtocolResult<()> {
        self.check_open()?;
        self.repository.finalize(self, view_id)
    }

    fn commit_xa_cancel(&self, view_id: u32) -> ProtocolResult<()> {
        self.check_open()?;
        {
            let mut store = self.repository.store.lock();
            if let Some(prepared) = store.prepared.remove(&(self.id, view_id)) {
                store.release_targets(&prepared.owner, &prepared.held);
                debug!(session = self.id, view = view_id, "xa commit cancelled");
            }
        }
        self.repository.locks_released.notify_all();
        Ok(())
    }

    fn lock_objects(&self, request: &LockObjectsRequest) -> ProtocolResult<LockObjectsResult> {
        self.check_open()?;
        self.repository.lock(self, request)
    }

    fn unlock_objects(&self, request: &UnlockObjectsRequest) -> ProtocolResult<UnlockObjectsResult> {
        self.check_open()?;
        Ok(self.repository.unlock(self, request))
    }

    fn load_revisions(&self, request: &LoadRevisionsRequest) -> ProtocolResult<Vec<Revision>> {
        self.check_open()?;
        Ok(self.repository.load(request))
    }

    fn query_lobs(&self, ids: &[LobId]) -> ProtocolResult<Vec<LobId>> {
        self.check_open()?;
        let store = self.repository.store.lock();
        Ok(ids.iter().filter(|id| store.lobs.contains_key(id)).copied().collect())
    }

    fn load_lob(&self, id: LobId) -> ProtocolResult<Vec<u8>> {
        self.check_open()?;
        self.repository
            .store
            .lock()
            .lobs
            .get(&id)
            .cloned()
            .ok_or_else(|| ProtocolError::Remote(format!("lob {id} not found")))
    }

    fn notifications(&self) -> &NotificationHub {
        &self.hub
    }
}
