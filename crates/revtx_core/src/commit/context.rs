//! The payload of one commit.

use crate::config::TransactionConfig;
use crate::error::CoreResult;
use crate::transaction::state::TransactionState;
use crate::types::TransactionId;
use revtx_model::{
    BranchId, ChangeSetData, FeatureDelta, IdAndVersion, IdMapper, Lob, LobId, LockState, ObjectId,
    ReferenceAdjuster, Revision, RevisionDelta, Version,
};
use revtx_protocol::{with_retry, CommitData, CommitRequest, PackageUnit, RetryConfig, SessionProtocol};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Snapshot of what a commit sends, built under the transaction lock.
///
/// With a committables filter set on the transaction only the listed
/// objects are included; leaving anything pending makes the context a
/// partial commit. Without a filter a context is never partial.
#[derive(Debug, Clone)]
pub struct CommitContext {
    transaction: TransactionId,
    branch: BranchId,
    comment: Option<String>,
    new_objects: BTreeMap<ObjectId, Revision>,
    dirty_objects: BTreeMap<ObjectId, Revision>,
    revision_deltas: BTreeMap<ObjectId, RevisionDelta>,
    detached_objects: BTreeMap<ObjectId, Version>,
    new_package_units: Vec<PackageUnit>,
    locks_on_new_objects: Vec<LockState>,
    lobs: Vec<Lob>,
    partial: bool,
    mapper: IdMapper,
}

impl CommitContext {
    pub(crate) fn build(state: &TransactionState) -> Self {
        let filter = state.committables.as_ref();
        let included = |id: &ObjectId| filter.map_or(true, |f| f.contains(id));
        let mut partial = false;

        let mut new_objects = BTreeMap::new();
        for id in state.chain.all_new_objects() {
            let Some(object) = state.objects.live(id) else {
                continue;
            };
            if included(&id) {
                new_objects.insert(id, object.revision.clone());
            } else {
                partial = true;
            }
        }

        let mut dirty_objects = BTreeMap::new();
        for id in state.chain.all_dirty_objects() {
            let Some(object) = state.objects.live(id) else {
                continue;
            };
            if included(&id) {
                dirty_objects.insert(id, object.revision.clone());
            } else {
                partial = true;
            }
        }

        let mut revision_deltas = BTreeMap::new();
        for (id, delta) in state.chain.all_revision_deltas() {
            if delta.is_empty() {
                continue;
            }
            if included(&id) {
                revision_deltas.insert(id, delta);
            } else {
                partial = true;
            }
        }

        let mut detached_objects = BTreeMap::new();
        for id in state.chain.all_detached_objects() {
            if included(&id) {
                detached_objects.insert(id, state.detached_version(id));
            } else {
                partial = true;
            }
        }

        let used: BTreeSet<&str> = new_objects
            .values()
            .map(|r: &Revision| r.class().package.as_str())
            .collect();
        let new_package_units = state
            .packages
            .new_units()
            .into_iter()
            .filter(|unit| used.contains(unit.uri.as_str()))
            .collect();

        let locks_on_new_objects = state
            .lock_states
            .iter()
            .filter(|(id, _)| new_objects.contains_key(id))
            .map(|(_, lock)| lock.clone())
            .collect();

        Self {
            transaction: state.id,
            branch: state.branch_point.branch,
            comment: state.comment.clone(),
            new_objects,
            dirty_objects,
            revision_deltas,
            detached_objects,
            new_package_units,
            locks_on_new_objects,
            lobs: Vec::new(),
            partial,
            mapper: IdMapper::new(),
        }
    }

    /// Gathers the lob payloads the repository does not hold yet.
    pub(crate) fn collect_lobs(
        &mut self,
        state: &TransactionState,
        session: &dyn SessionProtocol,
        retry: &RetryConfig,
    ) -> CoreResult<()> {
        let mut ids: Vec<LobId> = Vec::new();
        let mut note = |id: LobId| {
            if !ids.contains(&id) {
                ids.push(id);
            }
        };
        for revision in self.new_objects.values() {
            for lob in revision.lobs() {
                note(lob.id);
            }
        }
        for delta in self.revision_deltas.values() {
            for change in delta.feature_deltas() {
                for_each_written_value(change, &mut |value| {
                    value.for_each_lob(&mut |lob| note(lob.id));
                });
            }
        }
        if ids.is_empty() {
            return Ok(());
        }

        let known = with_retry(retry, || session.query_lobs(&ids))?;
        for id in ids.iter().filter(|id| !known.contains(id)) {
            match state.lobs.get(id) {
                Some(lob) => self.lobs.push(lob.clone()),
                None => warn!(transaction = %self.transaction, lob = ?id, "lob payload not available"),
            }
        }
        debug!(
            transaction = %self.transaction,
            referenced = ids.len(),
            sent = self.lobs.len(),
            "collected lobs"
        );
        Ok(())
    }

    /// Builds the wire request.
    pub fn request(&self, config: &TransactionConfig) -> CommitRequest {
        CommitRequest {
            view_id: self.transaction.as_u32(),
            branch: self.branch,
            comment: self.comment.clone(),
            release_locks: config.auto_release_locks && !self.partial,
            partial: self.partial,
            data: self.commit_data(),
            locks_on_new_objects: self.locks_on_new_objects.clone(),
            lobs: self.lobs.clone(),
            timeout: config.commit_timeout,
        }
    }

    /// The objects section of the request.
    pub fn commit_data(&self) -> CommitData {
        CommitData {
            new_package_units: self.new_package_units.clone(),
            new_objects: self.new_objects.values().cloned().collect(),
            changed_objects: self.revision_deltas.values().cloned().collect(),
            detached_objects: self
                .detached_objects
                .iter()
                .map(|(id, version)| IdAndVersion::new(*id, *version))
                .collect(),
        }
    }

    /// The change set as it will be reported after the commit.
    pub fn change_set_data(&self) -> ChangeSetData {
        self.commit_data().change_set()
    }

    /// Owning transaction.
    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    /// Commit comment.
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Returns true if pending changes remain outside this commit.
    pub fn is_partial_commit(&self) -> bool {
        self.partial
    }

    /// Returns true if there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.new_objects.is_empty()
            && self.revision_deltas.is_empty()
            && self.detached_objects.is_empty()
            && self.new_package_units.is_empty()
    }

    /// New objects by ID.
    pub fn new_objects(&self) -> &BTreeMap<ObjectId, Revision> {
        &self.new_objects
    }

    /// Current revisions of dirty objects.
    pub fn dirty_objects(&self) -> &BTreeMap<ObjectId, Revision> {
        &self.dirty_objects
    }

    /// Deltas of dirty objects.
    pub fn revision_deltas(&self) -> &BTreeMap<ObjectId, RevisionDelta> {
        &self.revision_deltas
    }

    /// Detached objects with the version they were detached at.
    pub fn detached_objects(&self) -> &BTreeMap<ObjectId, Version> {
        &self.detached_objects
    }

    /// Packages sent with the commit.
    pub fn new_package_units(&self) -> &[PackageUnit] {
        &self.new_package_units
    }

    /// Lob payloads sent with the commit.
    pub fn lobs(&self) -> &[Lob] {
        &self.lobs
    }

    /// Temporary to permanent mappings applied by the commit.
    pub fn id_mapper(&self) -> &IdMapper {
        &self.mapper
    }

    /// Returns true if `id` is part of this commit.
    pub fn includes(&self, id: ObjectId) -> bool {
        self.new_objects.contains_key(&id)
            || self.dirty_objects.contains_key(&id)
            || self.revision_deltas.contains_key(&id)
            || self.detached_objects.contains_key(&id)
    }

    /// Looks up a new or dirty object by its ID before or after the commit.
    pub fn lookup(&self, id: ObjectId) -> Option<&Revision> {
        self.new_objects
            .get(&id)
            .or_else(|| self.dirty_objects.get(&id))
    }

    /// Rewrites the context to the permanent IDs assigned by the commit.
    ///
    /// Objects stay reachable through [`lookup`](Self::lookup) under their
    /// new IDs.
    pub(crate) fn apply_result(&mut self, mapper: &IdMapper) {
        if mapper.is_empty() {
            return;
        }
        self.new_objects = std::mem::take(&mut self.new_objects)
            .into_values()
            .map(|mut revision| {
                revision.set_id(mapper.adjust(revision.id()));
                revision.adjust_references(mapper);
                (revision.id(), revision)
            })
            .collect();
        for revision in self.dirty_objects.values_mut() {
            revision.adjust_references(mapper);
        }
        for delta in self.revision_deltas.values_mut() {
            delta.adjust_references(mapper);
        }
        for (from, to) in mapper.mappings() {
            self.mapper.insert(*from, *to);
        }
    }
}

/// Calls `f` for every value a feature change writes.
fn for_each_written_value(change: &FeatureDelta, f: &mut dyn FnMut(&revtx_model::FeatureValue)) {
    match change {
        FeatureDelta::Set { value, .. } | FeatureDelta::Add { value, .. } => f(value),
        FeatureDelta::List { changes, .. } => {
            for change in changes {
                for_each_written_value(change, f);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::state::tests::{folder_class, loaded, state};
    use revtx_model::{FeatureValue, Timestamp, BranchPoint};
    use revtx_protocol::{CommitTransactionResult, MockSession};

    #[test]
    fn full_context_is_not_partial() {
        let mut state = state();
        let parent = loaded(&mut state, 1);
        let child = state.new_object(folder_class()).unwrap();
        state.add_child(parent, "children", child).unwrap();

        let context = CommitContext::build(&state);
        assert!(!context.is_partial_commit());
        assert!(context.new_objects().contains_key(&child));
        assert!(context.revision_deltas().contains_key(&parent));
        // The package arrived with the loaded parent.
        assert!(context.new_package_units().is_empty());

        let request = context.request(&TransactionConfig::default());
        assert!(request.release_locks);
        assert!(!request.partial);
        assert_eq!(request.data.new_objects.len(), 1);
        assert_eq!(request.data.changed_objects.len(), 1);
    }

    #[test]
    fn first_object_of_a_package_ships_the_unit() {
        let mut state = state();
        let child = state.new_object(folder_class()).unwrap();

        let context = CommitContext::build(&state);
        assert!(context.new_objects().contains_key(&child));
        assert_eq!(context.new_package_units().len(), 1);
    }

    #[test]
    fn filter_that_leaves_changes_makes_partial_commit() {
        let mut state = state();
        let a = loaded(&mut state, 1);
        let b = loaded(&mut state, 2);
        state.set_value(a, "name", "a".into()).unwrap();
        state.set_value(b, "name", "b".into()).unwrap();
        state.committables = Some(BTreeSet::from([a]));

        let context = CommitContext::build(&state);
        assert!(context.is_partial_commit());
        assert!(context.includes(a));
        assert!(!context.includes(b));
        assert!(!context.request(&TransactionConfig::default()).release_locks);
    }

    #[test]
    fn filter_covering_everything_is_not_partial() {
        let mut state = state();
        let a = loaded(&mut state, 1);
        state.set_value(a, "name", "a".into()).unwrap();
        state.committables = Some(BTreeSet::from([a]));
        assert!(!CommitContext::build(&state).is_partial_commit());
    }

    #[test]
    fn only_unknown_lobs_are_sent() {
        let mut state = state();
        let id = loaded(&mut state, 1);
        let known = Lob::blob(vec![1, 2, 3]);
        let unknown = Lob::clob("fresh");
        state.set_lob(id, "name", known.clone()).unwrap();
        let other = loaded(&mut state, 2);
        state.set_lob(other, "name", unknown.clone()).unwrap();

        let session = MockSession::new();
        session.add_known_lob(known.id());
        let mut context = CommitContext::build(&state);
        context
            .collect_lobs(&state, &session, &RetryConfig::no_retry())
            .unwrap();
        assert_eq!(context.lobs(), &[unknown]);
    }

    #[test]
    fn lookup_follows_id_mapping() {
        let mut state = state();
        let id = state.new_object(folder_class()).unwrap();
        let holder = loaded(&mut state, 1);
        state.add_value(holder, "links", 0, FeatureValue::Ref(id)).unwrap();

        let mut context = CommitContext::build(&state);
        let result = CommitTransactionResult::success(
            BranchPoint::new(BranchId::MAIN, Timestamp::new(9)),
            Timestamp::new(8),
        )
        .with_mapping(id, ObjectId::permanent(77));
        context.apply_result(&result.reference_adjuster());

        let found = context.lookup(ObjectId::permanent(77)).unwrap();
        assert_eq!(found.id(), ObjectId::permanent(77));
        assert!(context.lookup(id).is_none());
        let links = context.dirty_objects()[&holder].list("links").unwrap().to_vec();
        assert_eq!(links, vec![FeatureValue::Ref(ObjectId::permanent(77))]);
    }
}
