//! Protocol requests and results.

use revtx_model::{
    BranchId, BranchPoint, ChangeSetData, IdAndVersion, IdMapper, Lob, LockState, LockType,
    ObjectId, Revision, RevisionDelta, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Opens a session on a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSessionRequest {
    /// Repository name.
    pub repository_name: String,
    /// Authenticated user.
    pub user_id: String,
    /// Whether the session wants change notifications pushed.
    pub passive_update: bool,
}

/// Result of opening a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSessionResult {
    /// Session number assigned by the repository.
    pub session_id: u32,
    /// Repository identity.
    pub repository_uuid: Uuid,
    /// Whether the repository supports branches.
    pub supports_branching: bool,
    /// Time of the last commit the repository knows about.
    pub last_update_time: Timestamp,
}

/// Load state of a package (schema unit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackageState {
    /// Known only to the client; must be sent with the next commit.
    New,
    /// Known to the repository.
    Loaded,
}

/// A package (schema unit) a commit depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageUnit {
    /// Package URI.
    pub uri: String,
    /// Load state.
    pub state: PackageState,
}

/// Payload of a commit: the condensed change set plus new packages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitData {
    /// Packages the repository does not know yet.
    pub new_package_units: Vec<PackageUnit>,
    /// Full revisions of created objects.
    pub new_objects: Vec<Revision>,
    /// Deltas of modified objects.
    pub changed_objects: Vec<RevisionDelta>,
    /// Removed objects.
    pub detached_objects: Vec<IdAndVersion>,
}

impl CommitData {
    /// Returns the change-set part of the payload.
    #[must_use]
    pub fn change_set(&self) -> ChangeSetData {
        ChangeSetData::new(
            self.new_objects.clone(),
            self.changed_objects.clone(),
            self.detached_objects.clone(),
        )
    }

    /// Returns true if nothing would be committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new_package_units.is_empty()
            && self.new_objects.is_empty()
            && self.changed_objects.is_empty()
            && self.detached_objects.is_empty()
    }
}

/// A commit request (single transaction or XA phase 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    /// Committing view.
    pub view_id: u32,
    /// Target branch.
    pub branch: BranchId,
    /// Commit comment.
    pub comment: Option<String>,
    /// Release the view's locks once committed.
    pub release_locks: bool,
    /// Only a subset of the pending changes is being committed.
    pub partial: bool,
    /// The change payload.
    pub data: CommitData,
    /// Lock states to establish on newly created objects.
    pub locks_on_new_objects: Vec<LockState>,
    /// Lob payloads the repository does not have yet.
    pub lobs: Vec<Lob>,
    /// Time the caller is willing to wait.
    pub timeout: Duration,
}

/// A commit made on behalf of another user, without a client view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitDelegationRequest {
    /// Target branch.
    pub branch: BranchId,
    /// User the commit is attributed to.
    pub user_id: String,
    /// Commit comment.
    pub comment: Option<String>,
    /// The change payload.
    pub data: CommitData,
    /// Lob payloads.
    pub lobs: Vec<Lob>,
}

/// Phase 2 of an XA commit: ID mappings contributed by other participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XaPhase2Request {
    /// Committing view.
    pub view_id: u32,
    /// Temporary-to-permanent mappings for objects referenced across participants.
    pub id_mappings: HashMap<ObjectId, ObjectId>,
}

/// A cross-reference that blocks a commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectReference {
    /// Referencing object.
    pub source: ObjectId,
    /// Referencing feature.
    pub feature: String,
    /// Referenced object.
    pub target: ObjectId,
}

/// Outcome of a commit call.
///
/// A rejected commit has a rollback message; everything else describes the
/// new repository state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitTransactionResult {
    /// Why the repository refused the commit, if it did.
    pub rollback_message: Option<String>,
    /// Branch point of the new commit (or of the failed attempt).
    pub branch_point: BranchPoint,
    /// Time of the previous commit on the branch.
    pub previous_timestamp: Timestamp,
    /// Temporary-to-permanent ID assignments.
    pub id_mappings: HashMap<ObjectId, ObjectId>,
    /// Lock states after the commit.
    pub new_lock_states: Vec<LockState>,
    /// References to detached objects that blocked the commit.
    pub xrefs: Vec<ObjectReference>,
}

impl CommitTransactionResult {
    /// Creates a successful result.
    #[must_use]
    pub fn success(branch_point: BranchPoint, previous_timestamp: Timestamp) -> Self {
        Self {
            rollback_message: None,
            branch_point,
            previous_timestamp,
            id_mappings: HashMap::new(),
            new_lock_states: Vec::new(),
            xrefs: Vec::new(),
        }
    }

    /// Creates a rejected result.
    pub fn rejected(message: impl Into<String>, branch_point: BranchPoint, previous_timestamp: Timestamp) -> Self {
        Self {
            rollback_message: Some(message.into()),
            ..Self::success(branch_point, previous_timestamp)
        }
    }

    /// Adds an ID mapping.
    #[must_use]
    pub fn with_mapping(mut self, from: ObjectId, to: ObjectId) -> Self {
        self.id_mappings.insert(from, to);
        self
    }

    /// Adds blocking cross-references.
    #[must_use]
    pub fn with_xrefs(mut self, xrefs: Vec<ObjectReference>) -> Self {
        self.xrefs = xrefs;
        self
    }

    /// Returns true if the repository accepted the commit.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.rollback_message.is_none()
    }

    /// Returns an adjuster that rewrites temporary IDs to permanent ones.
    #[must_use]
    pub fn reference_adjuster(&self) -> IdMapper {
        IdMapper::from_mappings(self.id_mappings.clone())
    }
}

/// Locks objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockObjectsRequest {
    /// Requesting view.
    pub view_id: u32,
    /// Branch point the client sees.
    pub branch_point: BranchPoint,
    /// Objects with the versions the client holds.
    pub targets: Vec<IdAndVersion>,
    /// Lock type.
    pub lock_type: LockType,
    /// Also lock contained objects.
    pub recursive: bool,
    /// Maximum time to wait for conflicting locks.
    pub timeout: Duration,
    /// Wait for a concurrent commit to reach the client before failing on
    /// stale versions.
    pub wait_for_update: bool,
}

/// Result of a lock request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockObjectsResult {
    /// All locks were granted.
    pub successful: bool,
    /// The wait timed out.
    pub timed_out: bool,
    /// The client must wait for an update before retrying.
    pub wait_for_update: bool,
    /// Timestamp the client must reach before retrying.
    pub required_timestamp: Timestamp,
    /// Targets whose client version is outdated.
    pub stale_revisions: Vec<IdAndVersion>,
    /// Lock states after the request.
    pub new_lock_states: Vec<LockState>,
    /// Time the locks were granted.
    pub timestamp: Timestamp,
}

impl LockObjectsResult {
    /// Creates a successful result.
    #[must_use]
    pub fn granted(new_lock_states: Vec<LockState>, timestamp: Timestamp) -> Self {
        Self {
            successful: true,
            timed_out: false,
            wait_for_update: false,
            required_timestamp: Timestamp::UNSPECIFIED,
            stale_revisions: Vec::new(),
            new_lock_states,
            timestamp,
        }
    }

    /// Creates a result for a wait that timed out.
    #[must_use]
    pub fn timed_out() -> Self {
        Self {
            successful: false,
            timed_out: true,
            ..Self::granted(Vec::new(), Timestamp::UNSPECIFIED)
        }
    }

    /// Creates a result listing outdated client revisions.
    #[must_use]
    pub fn stale(stale_revisions: Vec<IdAndVersion>) -> Self {
        Self {
            successful: false,
            stale_revisions,
            ..Self::granted(Vec::new(), Timestamp::UNSPECIFIED)
        }
    }
}

/// Unlocks objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockObjectsRequest {
    /// Requesting view.
    pub view_id: u32,
    /// Objects to unlock; `None` releases everything the view holds.
    pub targets: Option<Vec<ObjectId>>,
    /// Lock type to release; `None` releases all types.
    pub lock_type: Option<LockType>,
    /// Also unlock contained objects.
    pub recursive: bool,
}

impl UnlockObjectsRequest {
    /// Releases every lock of a view.
    #[must_use]
    pub const fn all(view_id: u32) -> Self {
        Self {
            view_id,
            targets: None,
            lock_type: None,
            recursive: false,
        }
    }
}

/// Result of an unlock request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockObjectsResult {
    /// Lock states after the request.
    pub new_lock_states: Vec<LockState>,
    /// Time the locks were released.
    pub timestamp: Timestamp,
}

/// Restricts which features are loaded when prefetching a class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRule {
    /// Qualified class name.
    pub class: String,
    /// Reference features to follow.
    pub features: Vec<String>,
}

/// Loads revisions in one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRevisionsRequest {
    /// Requested objects.
    pub ids: Vec<ObjectId>,
    /// Branch point to read at.
    pub branch_point: BranchPoint,
    /// Levels of referenced objects to load along.
    pub prefetch_depth: u32,
    /// Per-class rules for partial loading; empty follows every reference.
    pub fetch_rules: Vec<FetchRule>,
}

impl LoadRevisionsRequest {
    /// Loads `ids` without prefetching.
    #[must_use]
    pub fn new(ids: Vec<ObjectId>, branch_point: BranchPoint) -> Self {
        Self {
            ids,
            branch_point,
            prefetch_depth: 0,
            fetch_rules: Vec::new(),
        }
    }

    /// Sets the prefetch depth.
    #[must_use]
    pub fn with_prefetch_depth(mut self, depth: u32) -> Self {
        self.prefetch_depth = depth;
        self
    }

    /// Adds a fetch rule.
    #[must_use]
    pub fn with_fetch_rule(mut self, rule: FetchRule) -> Self {
        self.fetch_rules.push(rule);
        self
    }
}

/// Summary of one commit, local or remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Branch point of the commit.
    pub branch_point: BranchPoint,
    /// Time of the previous commit on the branch.
    pub previous_timestamp: Timestamp,
    /// Committing user.
    pub user_id: String,
    /// Commit comment.
    pub comment: Option<String>,
    /// What the commit changed, with permanent IDs.
    pub change_set: ChangeSetData,
    /// Temporary-to-permanent ID assignments (empty for remote commits).
    pub id_mappings: HashMap<ObjectId, ObjectId>,
}
