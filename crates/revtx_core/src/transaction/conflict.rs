//! Remote invalidation and conflict resolution.

use super::events::{ObjectChange, TransactionEvent};
use super::state::TransactionState;
use crate::error::{CoreError, CoreResult};
use crate::object::{ManagedObject, ObjectEvent, ObjectState};
use revtx_model::{ObjectId, Revision};
use revtx_protocol::CommitInfo;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Resolves conflicts raised by remote commits.
///
/// Resolvers run in registration order after every invalidation that left
/// conflicts behind. If one fails, the transaction is restored to its state
/// before the first resolver ran.
pub trait ConflictResolver: Send + Sync {
    /// Resolves some or all conflicts in `conflicts`.
    fn resolve_conflicts(&self, conflicts: &mut ConflictSet<'_>) -> CoreResult<()>;
}

/// The conflicting objects of a transaction, with resolution operations.
pub struct ConflictSet<'a> {
    state: &'a mut TransactionState,
}

impl<'a> ConflictSet<'a> {
    pub(crate) fn new(state: &'a mut TransactionState) -> Self {
        Self { state }
    }

    /// IDs of the objects currently in conflict, in ID order.
    pub fn ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<_> = self
            .state
            .objects
            .live_objects()
            .filter(|o| o.conflict)
            .map(|o| o.id)
            .collect();
        ids.sort();
        ids
    }

    /// Looks up a live object.
    pub fn object(&self, id: ObjectId) -> Option<&ManagedObject> {
        self.state.objects.live(id)
    }

    /// Replays the local changes of `id` on top of the remote revision.
    ///
    /// Fails if the remote commit detached the object.
    pub fn rebase_local(&mut self, id: ObjectId) -> CoreResult<()> {
        let remote = self.take_remote_revision(id)?.ok_or_else(|| {
            CoreError::invalid_operation(format!("{id} was detached remotely and cannot be rebased"))
        })?;
        let mut local = remote.clone();
        if let Some(delta) = self.state.chain.merged_delta(id, 0, self.state.chain.len()) {
            self.state.merge_delta(&mut local, &delta)?;
        }
        for log in self.state.chain.iter_mut() {
            if let Some(delta) = log.revision_deltas.get_mut(&id) {
                delta.set_version(remote.version());
            }
        }
        self.state.clean_revisions.insert(id, remote);
        if let Some(object) = self.state.objects.get_mut(id) {
            object.revision = local;
        }
        self.state.clear_conflict(id);
        debug!(object = %id, "rebased local changes on remote revision");
        Ok(())
    }

    /// Drops the local changes of `id` in favor of the remote state.
    pub fn take_remote(&mut self, id: ObjectId) -> CoreResult<()> {
        let remote = self.take_remote_revision(id)?;
        for log in self.state.chain.iter_mut() {
            log.forget(id);
        }
        self.state.clean_revisions.remove(&id);
        self.state.clear_conflict(id);
        match remote {
            Some(remote) => {
                self.state.objects.fire(id, ObjectEvent::Rollback)?;
                if let Some(object) = self.state.objects.get_mut(id) {
                    object.revision = remote;
                }
            }
            None => {
                self.state.objects.remove(id);
            }
        }
        debug!(object = %id, "took remote state");
        Ok(())
    }

    /// Keeps the local changes of `id` as they are.
    ///
    /// The next commit is based on the remote version.
    pub fn mark_resolved(&mut self, id: ObjectId) -> CoreResult<()> {
        if let Some(remote) = self.take_remote_revision(id)? {
            for log in self.state.chain.iter_mut() {
                if let Some(delta) = log.revision_deltas.get_mut(&id) {
                    delta.set_version(remote.version());
                }
            }
            self.state.clean_revisions.insert(id, remote);
        }
        self.state.clear_conflict(id);
        Ok(())
    }

    fn take_remote_revision(&mut self, id: ObjectId) -> CoreResult<Option<Revision>> {
        let object = self
            .state
            .objects
            .get_mut(id)
            .filter(|o| o.conflict)
            .ok_or_else(|| CoreError::invalid_operation(format!("{id} is not in conflict")))?;
        Ok(object.remote_revision.take())
    }
}

/// Rebases every local change onto the remote revision.
#[derive(Debug, Default, Clone, Copy)]
pub struct RebaseResolver;

impl ConflictResolver for RebaseResolver {
    fn resolve_conflicts(&self, conflicts: &mut ConflictSet<'_>) -> CoreResult<()> {
        for id in conflicts.ids() {
            conflicts.rebase_local(id)?;
        }
        Ok(())
    }
}

/// Discards every conflicting local change.
#[derive(Debug, Default, Clone, Copy)]
pub struct TakeRemoteResolver;

impl ConflictResolver for TakeRemoteResolver {
    fn resolve_conflicts(&self, conflicts: &mut ConflictSet<'_>) -> CoreResult<()> {
        for id in conflicts.ids() {
            conflicts.take_remote(id)?;
        }
        Ok(())
    }
}

impl TransactionState {
    /// Brings the transaction up to date with a commit made elsewhere.
    ///
    /// Clean objects take the remote change. Dirty objects keep their local
    /// state and are flagged as conflicting with the remote revision.
    pub(crate) fn invalidate(&mut self, commit: &CommitInfo) -> CoreResult<Vec<ObjectChange>> {
        if commit.branch_point.branch != self.branch_point.branch {
            return Ok(Vec::new());
        }
        if self.last_commit_time.is_specified() && commit.branch_point.timestamp == self.last_commit_time {
            return Ok(Vec::new());
        }
        let mut changes = Vec::new();

        for delta in &commit.change_set.changed_objects {
            let id = delta.id();
            let Some(object) = self.objects.live(id) else {
                continue;
            };
            match object.state {
                ObjectState::Clean => {
                    if object.revision.version() > delta.version() {
                        continue;
                    }
                    let old = object.revision.clone();
                    let mut new = old.clone();
                    self.replay_delta(&mut new, delta)?;
                    new.set_version(delta.version().next());
                    new.set_branch_point(commit.branch_point);
                    self.objects.fire(id, ObjectEvent::Invalidate)?;
                    if let Some(object) = self.objects.get_mut(id) {
                        object.revision = new.clone();
                    }
                    changes.push(ObjectChange {
                        id,
                        old: Some(old),
                        new: Some(new),
                    });
                }
                ObjectState::Dirty => {
                    let Some(clean) = self.clean_revisions.get(&id) else {
                        warn!(transaction = %self.id, object = %id, "dirty object without clean revision");
                        continue;
                    };
                    if clean.version() > delta.version() {
                        continue;
                    }
                    let mut remote = clean.clone();
                    self.replay_delta(&mut remote, delta)?;
                    remote.set_version(delta.version().next());
                    remote.set_branch_point(commit.branch_point);
                    if let Some(object) = self.objects.get_mut(id) {
                        object.remote_revision = Some(remote);
                    }
                    self.set_conflict(id);
                }
                _ => {}
            }
        }

        let mut removed = BTreeSet::new();
        for detached in &commit.change_set.detached_objects {
            let id = detached.id;
            let Some(object) = self.objects.live(id) else {
                continue;
            };
            match object.state {
                ObjectState::Clean => {
                    let old = object.revision.clone();
                    self.objects.fire(id, ObjectEvent::DetachRemote)?;
                    self.objects.remove(id);
                    removed.insert(id);
                    changes.push(ObjectChange {
                        id,
                        old: Some(old),
                        new: None,
                    });
                }
                ObjectState::Dirty => {
                    if let Some(object) = self.objects.get_mut(id) {
                        object.remote_revision = None;
                    }
                    self.set_conflict(id);
                }
                _ => {}
            }
        }

        if !removed.is_empty() {
            self.prune_references(&removed)?;
        }
        if !changes.is_empty() {
            info!(
                transaction = %self.id,
                objects = changes.len(),
                conflicts = self.conflicts,
                "applied remote commit"
            );
            self.events.push(TransactionEvent::ObjectsChanged(changes.clone()));
        }
        Ok(changes)
    }

    /// Drops references to objects that no longer exist.
    fn prune_references(&mut self, removed: &BTreeSet<ObjectId>) -> CoreResult<()> {
        let affected: Vec<(ObjectId, ObjectState, Revision)> = self
            .objects
            .live_objects()
            .filter_map(|object| {
                let mut pruned = object.revision.clone();
                pruned
                    .remove_references(|id| removed.contains(&id))
                    .then(|| (object.id, object.state, pruned))
            })
            .collect();
        for (id, state, pruned) in affected {
            if state == ObjectState::Clean {
                if let Some(object) = self.objects.get_mut(id) {
                    object.revision = pruned;
                }
            } else {
                self.replace_revision(id, pruned)?;
            }
        }
        Ok(())
    }

    /// Runs `resolvers` over the current conflicts.
    ///
    /// On failure every change the resolvers made is undone.
    pub(crate) fn resolve_conflicts(&mut self, resolvers: &[Arc<dyn ConflictResolver>]) -> CoreResult<()> {
        if self.conflicts == 0 || resolvers.is_empty() {
            return Ok(());
        }
        let objects = self.objects.clone();
        let chain = self.chain.clone();
        let clean_revisions = self.clean_revisions.clone();
        let conflicts = self.conflicts;

        for resolver in resolvers {
            if self.conflicts == 0 {
                break;
            }
            if let Err(err) = resolver.resolve_conflicts(&mut ConflictSet::new(self)) {
                warn!(transaction = %self.id, error = %err, "conflict resolver failed, restoring state");
                self.objects = objects;
                self.chain = chain;
                self.clean_revisions = clean_revisions;
                self.conflicts = conflicts;
                return Err(err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::state::tests::{loaded, state};
    use super::*;
    use revtx_model::{
        BranchId, BranchPoint, ChangeSetData, FeatureDelta, FeatureValue, IdAndVersion,
        RevisionDelta, Timestamp, Version,
    };
    use std::collections::HashMap;

    fn remote_commit(changed: Vec<RevisionDelta>, detached: Vec<IdAndVersion>) -> CommitInfo {
        CommitInfo {
            branch_point: BranchPoint::new(BranchId::MAIN, Timestamp::new(500)),
            previous_timestamp: Timestamp::new(400),
            user_id: "other".into(),
            comment: None,
            change_set: ChangeSetData::new(vec![], changed, detached),
            id_mappings: HashMap::new(),
        }
    }

    fn rename(id: ObjectId, name: &str) -> RevisionDelta {
        let mut delta = RevisionDelta::new(id, BranchId::MAIN, Version::FIRST);
        delta.add_feature_delta(FeatureDelta::Set {
            feature: "name".into(),
            value: name.into(),
            old_value: None,
        });
        delta
    }

    #[test]
    fn clean_object_takes_remote_change() {
        let mut state = state();
        let id = loaded(&mut state, 1);
        let changes = state.invalidate(&remote_commit(vec![rename(id, "remote")], vec![])).unwrap();

        assert_eq!(changes.len(), 1);
        let object = state.objects.get(id).unwrap();
        assert_eq!(object.state, ObjectState::Clean);
        assert_eq!(object.revision.get("name"), Some(&"remote".into()));
        assert_eq!(object.revision.version(), Version::new(2));
        assert_eq!(state.conflicts, 0);
    }

    #[test]
    fn dirty_object_conflicts() {
        let mut state = state();
        let id = loaded(&mut state, 1);
        state.set_value(id, "name", "local".into()).unwrap();
        state.invalidate(&remote_commit(vec![rename(id, "remote")], vec![])).unwrap();

        let object = state.objects.get(id).unwrap();
        assert!(object.conflict);
        assert_eq!(object.revision.get("name"), Some(&"local".into()));
        assert_eq!(
            object.remote_revision.as_ref().and_then(|r| r.get("name")),
            Some(&"remote".into())
        );
        assert_eq!(state.conflicts, 1);
    }

    #[test]
    fn own_commit_is_ignored() {
        let mut state = state();
        let id = loaded(&mut state, 1);
        state.last_commit_time = Timestamp::new(500);
        let changes = state.invalidate(&remote_commit(vec![rename(id, "remote")], vec![])).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn remote_detach_prunes_references() {
        let mut state = state();
        let holder = loaded(&mut state, 1);
        let target = loaded(&mut state, 2);
        state
            .objects
            .get_mut(holder)
            .unwrap()
            .revision
            .list_mut("links")
            .unwrap()
            .push(FeatureValue::Ref(target));

        state
            .invalidate(&remote_commit(vec![], vec![IdAndVersion::new(target, Version::FIRST)]))
            .unwrap();

        assert!(state.objects.get(target).is_none());
        let holder = state.objects.get(holder).unwrap();
        assert!(holder.revision.list("links").unwrap().is_empty());
        assert_eq!(holder.state, ObjectState::Clean);
    }

    #[test]
    fn rebase_keeps_local_change_on_remote_base() {
        let mut state = state();
        let id = loaded(&mut state, 1);
        state.add_value(id, "tags", 0, "local".into()).unwrap();
        state.invalidate(&remote_commit(vec![rename(id, "remote")], vec![])).unwrap();

        let resolvers: Vec<Arc<dyn ConflictResolver>> = vec![Arc::new(RebaseResolver)];
        state.resolve_conflicts(&resolvers).unwrap();

        let object = state.objects.get(id).unwrap();
        assert!(!object.conflict);
        assert_eq!(object.revision.get("name"), Some(&"remote".into()));
        assert_eq!(object.revision.list("tags").unwrap(), &["local".into()]);
        assert_eq!(state.chain.all_revision_deltas()[&id].version(), Version::new(2));
        assert_eq!(state.conflicts, 0);
    }

    #[test]
    fn take_remote_discards_local_change() {
        let mut state = state();
        let id = loaded(&mut state, 1);
        state.set_value(id, "name", "local".into()).unwrap();
        state.invalidate(&remote_commit(vec![rename(id, "remote")], vec![])).unwrap();

        let resolvers: Vec<Arc<dyn ConflictResolver>> = vec![Arc::new(TakeRemoteResolver)];
        state.resolve_conflicts(&resolvers).unwrap();

        let object = state.objects.get(id).unwrap();
        assert_eq!(object.state, ObjectState::Clean);
        assert_eq!(object.revision.get("name"), Some(&"remote".into()));
        assert!(state.chain.all_dirty_objects().is_empty());
    }

    struct Failing;

    impl ConflictResolver for Failing {
        fn resolve_conflicts(&self, conflicts: &mut ConflictSet<'_>) -> CoreResult<()> {
            let id = conflicts.ids()[0];
            conflicts.take_remote(id)?;
            Err(CoreError::invalid_operation("refused"))
        }
    }

    #[test]
    fn failing_resolver_restores_state() {
        let mut state = state();
        let id = loaded(&mut state, 1);
        state.set_value(id, "name", "local".into()).unwrap();
        state.invalidate(&remote_commit(vec![rename(id, "remote")], vec![])).unwrap();

        let resolvers: Vec<Arc<dyn ConflictResolver>> = vec![Arc::new(Failing)];
        assert!(state.resolve_conflicts(&resolvers).is_err());

        let object = state.objects.get(id).unwrap();
        assert!(object.conflict);
        assert_eq!(object.revision.get("name"), Some(&"local".into()));
        assert_eq!(state.conflicts, 1);
        assert!(state.chain.all_dirty_objects().contains(&id));
    }
}
