//! Mutable state of one transaction and the edit primitives on it.
//!
//! Everything here runs under the transaction lock. Public entry points
//! live on [`Transaction`](super::Transaction).

use super::events::TransactionEvent;
use crate::error::{CoreError, CoreResult};
use crate::object::{ContainerLinks, ManagedObject, ObjectEvent, ObjectRegistry, ObjectState};
use crate::package::PackageRegistry;
use crate::savepoint::{ChangeLog, SavepointChain, SavepointHandle};
use crate::types::TransactionId;
use revtx_model::{
    BranchPoint, ChangeSetData, ClassInfo, FeatureDelta, FeatureValue, IdAndVersion, Lob, LobId,
    LockState, ObjectId, Revision, RevisionDelta, TempIdGenerator, Timestamp,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

pub(crate) struct TransactionState {
    pub(crate) id: TransactionId,
    pub(crate) branch_point: BranchPoint,
    pub(crate) objects: ObjectRegistry,
    pub(crate) chain: SavepointChain<ChangeLog>,
    /// Revisions of persistent objects as they were before the first edit.
    pub(crate) clean_revisions: HashMap<ObjectId, Revision>,
    pub(crate) dirty: bool,
    pub(crate) conflicts: usize,
    pub(crate) ids: TempIdGenerator,
    pub(crate) committables: Option<BTreeSet<ObjectId>>,
    pub(crate) comment: Option<String>,
    pub(crate) last_commit_time: Timestamp,
    pub(crate) packages: PackageRegistry,
    pub(crate) lock_states: HashMap<ObjectId, LockState>,
    pub(crate) lobs: HashMap<LobId, Lob>,
    pub(crate) events: Vec<TransactionEvent>,
    /// Set while an XA commit holds prepared state on the repository.
    pub(crate) commit_in_progress: bool,
    pub(crate) closed: bool,
}

impl TransactionState {
    pub(crate) fn new(id: TransactionId, branch_point: BranchPoint) -> Self {
        Self {
            id,
            branch_point,
            objects: ObjectRegistry::new(),
            chain: SavepointChain::new(id),
            clean_revisions: HashMap::new(),
            dirty: false,
            conflicts: 0,
            ids: TempIdGenerator::new(),
            committables: None,
            comment: None,
            last_commit_time: Timestamp::UNSPECIFIED,
            packages: PackageRegistry::new(),
            lock_states: HashMap::new(),
            lobs: HashMap::new(),
            events: Vec::new(),
            commit_in_progress: false,
            closed: false,
        }
    }

    pub(crate) fn check_writable(&self) -> CoreResult<()> {
        if self.commit_in_progress {
            return Err(CoreError::invalid_operation(format!(
                "{} is in the middle of a distributed commit",
                self.id
            )));
        }
        Ok(())
    }

    pub(crate) fn mark_dirty(&mut self) {
        if !self.dirty {
            self.dirty = true;
            self.events.push(TransactionEvent::Started);
        }
    }

    /// Returns true if `id` still exists as far as this transaction knows.
    ///
    /// Permanent IDs that were never loaded are assumed to exist.
    pub(crate) fn exists(&self, id: ObjectId) -> bool {
        self.objects.is_live(id) || (!id.is_temporary() && !self.objects.is_retired(id))
    }

    // Registration

    pub(crate) fn new_object(&mut self, class: Arc<ClassInfo>) -> CoreResult<ObjectId> {
        self.check_writable()?;
        let id = self.ids.next_id();
        self.attach_new(Revision::new(id, class, self.branch_point.branch))?;
        Ok(id)
    }

    /// Registers `revision` as a new object in the last savepoint.
    pub(crate) fn attach_new(&mut self, revision: Revision) -> CoreResult<()> {
        let id = revision.id();
        if self.objects.is_live(id) {
            return Err(CoreError::DuplicateRegistration { id, kind: "new" });
        }
        if let Some(value) = id.temp_value() {
            self.ids.fast_forward(value);
        }
        self.packages.register_new(revision.class());
        self.objects
            .insert(ManagedObject::new(ObjectState::Transient, revision));
        self.objects.fire(id, ObjectEvent::Attach)?;
        self.register_new(id)
    }

    /// Registers a revision loaded from the repository as a clean object.
    pub(crate) fn load_object(&mut self, revision: Revision) -> CoreResult<()> {
        let id = revision.id();
        if id.is_temporary() {
            return Err(CoreError::invalid_operation(format!(
                "cannot load {id}: temporary IDs never come from the repository"
            )));
        }
        if self.objects.get(id).is_some() {
            return Ok(());
        }
        self.packages.register_loaded(revision.class());
        self.objects
            .insert(ManagedObject::new(ObjectState::Clean, revision));
        Ok(())
    }

    fn register_new(&mut self, id: ObjectId) -> CoreResult<()> {
        if !self.chain.last_mut().new_objects.insert(id) {
            return Err(CoreError::DuplicateRegistration { id, kind: "new" });
        }
        debug!(transaction = %self.id, object = %id, "registered new object");
        self.mark_dirty();
        Ok(())
    }

    pub(crate) fn register_dirty(&mut self, id: ObjectId) -> CoreResult<()> {
        if !self.chain.last_mut().dirty_objects.insert(id) {
            return Err(CoreError::DuplicateRegistration { id, kind: "dirty" });
        }
        debug!(transaction = %self.id, object = %id, "registered dirty object");
        self.mark_dirty();
        Ok(())
    }

    /// Records `delta` in the last savepoint.
    ///
    /// Objects created in the last savepoint are skipped: their revision
    /// already reflects every edit and is sent in full.
    pub(crate) fn register_feature_delta(&mut self, id: ObjectId, delta: FeatureDelta) {
        let Some(object) = self.objects.get(id) else {
            return;
        };
        if object.state == ObjectState::New
            && (self.chain.len() == 1 || self.chain.last().new_objects.contains(&id))
        {
            return;
        }
        let (branch, version) = match self.clean_revisions.get(&id) {
            Some(clean) => (clean.branch(), clean.version()),
            None => (object.revision.branch(), object.revision.version()),
        };
        self.chain
            .last_mut()
            .revision_deltas
            .entry(id)
            .or_insert_with(|| RevisionDelta::new(id, branch, version))
            .add_feature_delta(delta);
    }

    // Edits

    /// Applies one feature change to a live object and records it.
    ///
    /// The change is validated on a copy first, so a failing edit leaves
    /// the object untouched.
    pub(crate) fn write(&mut self, id: ObjectId, delta: FeatureDelta) -> CoreResult<()> {
        self.check_writable()?;
        let object = self.objects.require_live(id)?;
        let mut revision = object.revision.clone();
        delta.apply(&mut revision)?;
        let before = object.state;
        if before == ObjectState::Clean {
            self.clean_revisions
                .entry(id)
                .or_insert_with(|| object.revision.clone());
        }
        self.objects.fire(id, ObjectEvent::Write)?;
        self.objects.require_live_mut(id)?.revision = revision;
        if before == ObjectState::Clean {
            self.register_dirty(id)?;
        }
        self.register_feature_delta(id, delta);
        Ok(())
    }

    pub(crate) fn set_value(&mut self, id: ObjectId, feature: &str, value: FeatureValue) -> CoreResult<()> {
        let old_value = self.objects.require_live(id)?.revision.get(feature).cloned();
        self.write(
            id,
            FeatureDelta::Set {
                feature: feature.to_owned(),
                value,
                old_value,
            },
        )
    }

    pub(crate) fn unset_value(&mut self, id: ObjectId, feature: &str) -> CoreResult<()> {
        self.write(
            id,
            FeatureDelta::Unset {
                feature: feature.to_owned(),
            },
        )
    }

    pub(crate) fn add_value(
        &mut self,
        id: ObjectId,
        feature: &str,
        index: usize,
        value: FeatureValue,
    ) -> CoreResult<()> {
        self.write(
            id,
            FeatureDelta::Add {
                feature: feature.to_owned(),
                index,
                value,
            },
        )
    }

    pub(crate) fn remove_value(&mut self, id: ObjectId, feature: &str, index: usize) -> CoreResult<FeatureValue> {
        let list = self.objects.require_live(id)?.revision.list(feature)?;
        let value = list
            .get(index)
            .cloned()
            .ok_or_else(|| revtx_model::ModelError::IndexOutOfBounds {
                feature: feature.to_owned(),
                index,
                len: list.len(),
            })?;
        self.write(
            id,
            FeatureDelta::Remove {
                feature: feature.to_owned(),
                index,
                value: value.clone(),
            },
        )?;
        Ok(value)
    }

    pub(crate) fn move_value(&mut self, id: ObjectId, feature: &str, from: usize, to: usize) -> CoreResult<()> {
        let list = self.objects.require_live(id)?.revision.list(feature)?;
        let value = list
            .get(from)
            .cloned()
            .ok_or_else(|| revtx_model::ModelError::IndexOutOfBounds {
                feature: feature.to_owned(),
                index: from,
                len: list.len(),
            })?;
        self.write(
            id,
            FeatureDelta::Move {
                feature: feature.to_owned(),
                old_position: from,
                new_position: to,
                value,
            },
        )
    }

    pub(crate) fn clear_value(&mut self, id: ObjectId, feature: &str) -> CoreResult<()> {
        self.write(
            id,
            FeatureDelta::Clear {
                feature: feature.to_owned(),
            },
        )
    }

    pub(crate) fn set_container(
        &mut self,
        id: ObjectId,
        container: Option<ObjectId>,
        feature: Option<String>,
        resource: Option<ObjectId>,
    ) -> CoreResult<()> {
        self.write(
            id,
            FeatureDelta::Container {
                container,
                containing_feature: feature,
                resource,
            },
        )
    }

    /// Appends `child` to the containment list `feature` of `parent` and
    /// points the child's container at it.
    pub(crate) fn add_child(&mut self, parent: ObjectId, feature: &str, child: ObjectId) -> CoreResult<()> {
        let info = self.objects.require_live(parent)?.revision.feature_info(feature)?;
        if !info.is_containment() {
            return Err(CoreError::invalid_operation(format!(
                "feature '{feature}' of {parent} is not a containment"
            )));
        }
        let resource = self.objects.require_live(child)?.revision.resource();
        let index = self.objects.require_live(parent)?.revision.size(feature)?;
        self.add_value(parent, feature, index, FeatureValue::Ref(child))?;
        self.set_container(child, Some(parent), Some(feature.to_owned()), resource)
    }

    pub(crate) fn set_lob(&mut self, id: ObjectId, feature: &str, lob: Lob) -> CoreResult<()> {
        let reference = lob.reference;
        self.set_value(id, feature, FeatureValue::Lob(reference))?;
        self.lobs.insert(lob.id(), lob);
        Ok(())
    }

    // Detach and reattach

    /// Live objects contained in `root`, root first.
    fn containment_closure(&self, root: ObjectId) -> Vec<ObjectId> {
        let mut closure = Vec::new();
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            closure.push(id);
            queue.extend(self.objects.children_of(id));
        }
        closure
    }

    /// Detaches `id` and everything it contains.
    ///
    /// Returns the detached IDs, root first.
    pub(crate) fn detach(&mut self, id: ObjectId) -> CoreResult<Vec<ObjectId>> {
        self.check_writable()?;
        let root = self.objects.require_live(id)?.revision.clone();
        if let (Some(container), Some(feature)) = (root.container(), root.containing_feature()) {
            self.unlink_from_container(container, feature, id)?;
        }

        let closure = self.containment_closure(id);
        let members: BTreeSet<_> = closure.iter().copied().collect();
        for member in &closure {
            self.detach_single(*member)?;
        }

        // Container links are cleared only once every member is detached so
        // that links between members survive.
        for member in &closure {
            if let Some(object) = self.objects.get_mut(*member) {
                let outside = object
                    .revision
                    .container()
                    .map_or(true, |c| !members.contains(&c));
                if outside {
                    object.detached_links = Some(ContainerLinks::of(&object.revision));
                    object.revision.set_container(None, None);
                    object.revision.set_resource(None);
                }
            }
        }
        debug!(transaction = %self.id, object = %id, count = closure.len(), "detached");
        Ok(closure)
    }

    fn unlink_from_container(&mut self, container: ObjectId, feature: &str, id: ObjectId) -> CoreResult<()> {
        let Some(parent) = self.objects.live(container) else {
            return Ok(());
        };
        let info = parent.revision.feature_info(feature)?;
        if info.many {
            let position = parent
                .revision
                .list(feature)?
                .iter()
                .position(|v| v.as_id() == Some(id));
            if let Some(index) = position {
                self.remove_value(container, feature, index)?;
            }
        } else if parent.revision.get(feature).and_then(FeatureValue::as_id) == Some(id) {
            self.unset_value(container, feature)?;
        }
        Ok(())
    }

    fn detach_single(&mut self, id: ObjectId) -> CoreResult<()> {
        let (before, _) = self.objects.fire(id, ObjectEvent::Detach)?;
        let log = self.chain.last_mut();
        let stashed = log.revision_deltas.remove(&id);
        log.dirty_objects.remove(&id);
        if log.reattached_objects.remove(&id) {
            // Reattached and detached again in the same savepoint. The
            // pre-reattach snapshot stays for rollback.
            log.new_objects.remove(&id);
        } else if before == ObjectState::New {
            if log.new_objects.remove(&id) {
                log.discarded_objects.insert(id);
            } else {
                log.detached_objects.insert(id);
            }
        } else {
            log.detached_objects.insert(id);
        }

        if let Some(object) = self.objects.get_mut(id) {
            if before == ObjectState::Clean {
                self.clean_revisions
                    .entry(id)
                    .or_insert_with(|| object.revision.clone());
            }
            object.stashed_delta = stashed;
        }
        self.mark_dirty();
        Ok(())
    }

    /// Brings a detached object back into the graph.
    pub(crate) fn reattach(&mut self, id: ObjectId) -> CoreResult<()> {
        self.check_writable()?;
        let snapshot = self
            .objects
            .get(id)
            .cloned()
            .ok_or(CoreError::ObjectNotFound(id))?;
        self.objects.fire(id, ObjectEvent::Reattach)?;

        let object = self
            .objects
            .get_mut(id)
            .ok_or(CoreError::ObjectNotFound(id))?;
        let state = object.state;
        let stashed = object.stashed_delta.take();
        let links = object.detached_links.take();
        let relink = links
            .as_ref()
            .and_then(|l| l.container.zip(l.feature.clone()));
        if let Some(links) = links {
            links.restore(&mut object.revision);
        }

        let log = self.chain.last_mut();
        if log.discarded_objects.remove(&id) {
            // Created in this savepoint: it is simply new again.
            log.new_objects.insert(id);
        } else {
            log.reattached_objects.insert(id);
            log.reattached_from.entry(id).or_insert(snapshot);
            match state {
                ObjectState::New => {
                    log.new_objects.insert(id);
                }
                ObjectState::Dirty => {
                    log.dirty_objects.insert(id);
                }
                _ => {}
            }
        }
        if let Some(stashed) = stashed {
            if state != ObjectState::New {
                log.revision_deltas
                    .entry(id)
                    .and_modify(|d| d.merge(&stashed))
                    .or_insert(stashed);
            }
        }
        self.mark_dirty();

        if let Some((container, feature)) = relink {
            if let Some(parent) = self.objects.live(container) {
                let info = parent.revision.feature_info(&feature)?;
                if info.many {
                    let list = parent.revision.list(&feature)?;
                    if !list.iter().any(|v| v.as_id() == Some(id)) {
                        let index = list.len();
                        self.add_value(container, &feature, index, FeatureValue::Ref(id))?;
                    }
                } else {
                    self.set_value(container, &feature, FeatureValue::Ref(id))?;
                }
            }
        }
        debug!(transaction = %self.id, object = %id, ?state, "reattached");
        Ok(())
    }

    // Savepoints

    pub(crate) fn set_savepoint(&mut self) -> SavepointHandle {
        let snapshots: BTreeMap<ObjectId, Revision> = self
            .chain
            .last()
            .new_objects
            .iter()
            .filter_map(|id| {
                self.objects
                    .live(*id)
                    .map(|object| (*id, object.revision.clone()))
            })
            .collect();
        self.chain.last_mut().base_new_objects = snapshots;
        let handle = self.chain.push();
        self.chain.last_mut().was_dirty = self.dirty;
        debug!(transaction = %self.id, savepoint = %handle.id(), "savepoint set");
        handle
    }

    // Conflicts

    /// Raises the conflict flag of `id`; counts it only the first time.
    pub(crate) fn set_conflict(&mut self, id: ObjectId) {
        let Some(object) = self.objects.get_mut(id) else {
            return;
        };
        let first_time = !object.conflict;
        object.conflict = true;
        if first_time {
            self.conflicts += 1;
            self.events.push(TransactionEvent::Conflict {
                id,
                first: self.conflicts == 1,
            });
        }
    }

    pub(crate) fn clear_conflict(&mut self, id: ObjectId) {
        if let Some(object) = self.objects.get_mut(id) {
            if object.conflict {
                object.conflict = false;
                object.remote_revision = None;
                self.conflicts = self.conflicts.saturating_sub(1);
            }
        }
    }

    // Views

    /// Version a detached object was last seen with.
    pub(crate) fn detached_version(&self, id: ObjectId) -> revtx_model::Version {
        self.clean_revisions
            .get(&id)
            .or_else(|| self.objects.get(id).map(|o| &o.revision))
            .map(Revision::version)
            .unwrap_or_default()
    }

    pub(crate) fn change_set_data(&self) -> ChangeSetData {
        let new_objects = self
            .chain
            .all_new_objects()
            .into_iter()
            .filter_map(|id| self.objects.live(id).map(|o| o.revision.clone()))
            .collect();
        let changed_objects = self
            .chain
            .all_revision_deltas()
            .into_values()
            .filter(|d| !d.is_empty())
            .collect();
        let detached_objects = self
            .chain
            .all_detached_objects()
            .into_iter()
            .map(|id| IdAndVersion::new(id, self.detached_version(id)))
            .collect();
        ChangeSetData::new(new_objects, changed_objects, detached_objects)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use revtx_model::{BranchId, FeatureInfo, Version};

    pub(crate) fn folder_class() -> Arc<ClassInfo> {
        Arc::new(
            ClassInfo::new("shop", "Folder")
                .with_feature(FeatureInfo::attribute("name"))
                .with_feature(FeatureInfo::contents("children"))
                .with_feature(FeatureInfo::references("links"))
                .with_feature(FeatureInfo::attribute_list("tags")),
        )
    }

    pub(crate) fn state() -> TransactionState {
        TransactionState::new(TransactionId::new(1), BranchPoint::head(BranchId::MAIN))
    }

    pub(crate) fn loaded(state: &mut TransactionState, id: u64) -> ObjectId {
        let id = ObjectId::permanent(id);
        let mut revision = Revision::new(id, folder_class(), BranchId::MAIN);
        revision.set_version(Version::FIRST);
        state.load_object(revision).unwrap();
        id
    }

    #[test]
    fn first_registration_starts_transaction() {
        let mut state = state();
        let id = state.new_object(folder_class()).unwrap();
        assert_eq!(id, ObjectId::temp(1));
        assert!(state.dirty);
        assert_eq!(state.events, vec![TransactionEvent::Started]);

        state.new_object(folder_class()).unwrap();
        assert_eq!(state.events.len(), 1);
    }

    #[test]
    fn duplicate_new_registration_is_rejected() {
        let mut state = state();
        let id = state.new_object(folder_class()).unwrap();
        let revision = state.objects.get(id).unwrap().revision.clone();
        assert!(matches!(
            state.attach_new(revision),
            Err(CoreError::DuplicateRegistration { kind: "new", .. })
        ));
    }

    #[test]
    fn first_write_makes_clean_object_dirty() {
        let mut state = state();
        let id = loaded(&mut state, 10);
        state.set_value(id, "name", "a".into()).unwrap();
        state.set_value(id, "name", "b".into()).unwrap();

        assert_eq!(state.objects.state_of(id), Some(ObjectState::Dirty));
        assert!(state.clean_revisions[&id].get("name").is_none());
        let delta = &state.chain.last().revision_deltas[&id];
        assert_eq!(delta.feature_deltas().len(), 1);
        assert_eq!(delta.version(), Version::FIRST);
    }

    #[test]
    fn failed_write_leaves_object_untouched() {
        let mut state = state();
        let id = loaded(&mut state, 10);
        assert!(state.remove_value(id, "children", 3).is_err());
        assert_eq!(state.objects.state_of(id), Some(ObjectState::Clean));
        assert!(!state.dirty);
    }

    #[test]
    fn new_object_has_no_delta_in_creating_savepoint() {
        let mut state = state();
        let id = state.new_object(folder_class()).unwrap();
        state.set_value(id, "name", "x".into()).unwrap();
        assert!(state.chain.last().revision_deltas.is_empty());

        state.set_savepoint();
        state.set_value(id, "name", "y".into()).unwrap();
        assert!(state.chain.last().revision_deltas.contains_key(&id));
        assert!(state.chain.all_revision_deltas().is_empty());
    }

    #[test]
    fn detach_cascades_to_contained_objects() {
        let mut state = state();
        let parent = loaded(&mut state, 1);
        let child = state.new_object(folder_class()).unwrap();
        state.add_child(parent, "children", child).unwrap();
        let grandchild = state.new_object(folder_class()).unwrap();
        state.add_child(child, "children", grandchild).unwrap();

        let detached = state.detach(child).unwrap();
        assert_eq!(detached, vec![child, grandchild]);
        assert_eq!(state.objects.state_of(child), Some(ObjectState::Detached));
        assert!(state.objects.get(parent).unwrap().revision.list("children").unwrap().is_empty());

        // The link between two detached objects survives.
        let inner = &state.objects.get(grandchild).unwrap().revision;
        assert_eq!(inner.container(), Some(child));
        assert_eq!(state.objects.get(child).unwrap().revision.container(), None);
        assert!(state.chain.all_new_objects().is_empty());
    }

    #[test]
    fn detach_of_clean_object_is_recorded() {
        let mut state = state();
        let id = loaded(&mut state, 4);
        state.detach(id).unwrap();
        let data = state.change_set_data();
        assert_eq!(data.detached_objects, vec![IdAndVersion::new(id, Version::FIRST)]);
        assert!(state.dirty);
    }

    #[test]
    fn reattach_restores_state_and_links() {
        let mut state = state();
        let parent = loaded(&mut state, 1);
        let child = loaded(&mut state, 2);
        state.add_child(parent, "children", child).unwrap();
        state.set_savepoint();

        state.detach(child).unwrap();
        state.reattach(child).unwrap();

        let object = state.objects.get(child).unwrap();
        assert_eq!(object.state, ObjectState::Dirty);
        assert_eq!(object.revision.container(), Some(parent));
        let children = state.objects.get(parent).unwrap().revision.list("children").unwrap().to_vec();
        assert_eq!(children, vec![FeatureValue::Ref(child)]);
        assert!(state.chain.all_detached_objects().is_empty());
        assert!(state.chain.all_dirty_objects().contains(&child));
    }

    #[test]
    fn conflict_counter_counts_objects_once() {
        let mut state = state();
        let a = loaded(&mut state, 1);
        let b = loaded(&mut state, 2);
        state.set_conflict(a);
        state.set_conflict(a);
        state.set_conflict(b);
        assert_eq!(state.conflicts, 2);
        assert_eq!(
            state.events,
            vec![
                TransactionEvent::Conflict { id: a, first: true },
                TransactionEvent::Conflict { id: b, first: false },
            ]
        );
        state.clear_conflict(a);
        assert_eq!(state.conflicts, 1);
    }

    #[test]
    fn savepoint_snapshots_new_objects() {
        let mut state = state();
        let id = state.new_object(folder_class()).unwrap();
        state.set_value(id, "name", "base".into()).unwrap();
        state.mark_dirty();
        state.set_savepoint();
        let snapshot = &state.chain.first().base_new_objects[&id];
        assert_eq!(snapshot.get("name"), Some(&"base".into()));
        assert!(state.chain.last().was_dirty);
    }
}
