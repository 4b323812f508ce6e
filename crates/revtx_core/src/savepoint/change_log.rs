//! What one savepoint of a single transaction records, and the cumulative
//! views over a chain of them.

use super::chain::SavepointChain;
use crate::object::ManagedObject;
use revtx_model::{ObjectId, Revision, RevisionDelta};
use std::collections::{BTreeMap, BTreeSet};

/// Mutations recorded between one savepoint and the next.
///
/// Invariants maintained by the transaction:
/// - an ID is in at most one savepoint's `new_objects` at a time;
/// - at most one delta per ID per savepoint;
/// - an object created in this savepoint never has a delta here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeLog {
    pub(crate) new_objects: BTreeSet<ObjectId>,
    pub(crate) dirty_objects: BTreeSet<ObjectId>,
    pub(crate) detached_objects: BTreeSet<ObjectId>,
    pub(crate) reattached_objects: BTreeSet<ObjectId>,
    /// Objects created here and detached here again.
    pub(crate) discarded_objects: BTreeSet<ObjectId>,
    pub(crate) revision_deltas: BTreeMap<ObjectId, RevisionDelta>,
    /// Content of this savepoint's new objects when the next one was set.
    pub(crate) base_new_objects: BTreeMap<ObjectId, Revision>,
    /// Objects as they were right before being reattached here.
    pub(crate) reattached_from: BTreeMap<ObjectId, ManagedObject>,
    pub(crate) was_dirty: bool,
}

impl ChangeLog {
    /// Objects created in this savepoint.
    #[must_use]
    pub fn new_objects(&self) -> &BTreeSet<ObjectId> {
        &self.new_objects
    }

    /// Persistent objects first modified in this savepoint.
    #[must_use]
    pub fn dirty_objects(&self) -> &BTreeSet<ObjectId> {
        &self.dirty_objects
    }

    /// Objects detached in this savepoint.
    #[must_use]
    pub fn detached_objects(&self) -> &BTreeSet<ObjectId> {
        &self.detached_objects
    }

    /// Objects reattached in this savepoint.
    #[must_use]
    pub fn reattached_objects(&self) -> &BTreeSet<ObjectId> {
        &self.reattached_objects
    }

    /// Per-object deltas recorded in this savepoint.
    #[must_use]
    pub fn revision_deltas(&self) -> &BTreeMap<ObjectId, RevisionDelta> {
        &self.revision_deltas
    }

    /// Base snapshots of this savepoint's new objects.
    #[must_use]
    pub fn base_new_objects(&self) -> &BTreeMap<ObjectId, Revision> {
        &self.base_new_objects
    }

    /// Whether the transaction was dirty when this savepoint was set.
    #[must_use]
    pub fn was_dirty(&self) -> bool {
        self.was_dirty
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new_objects.is_empty()
            && self.dirty_objects.is_empty()
            && self.detached_objects.is_empty()
            && self.reattached_objects.is_empty()
            && self.discarded_objects.is_empty()
            && self.revision_deltas.is_empty()
    }

    /// Empties every map; `was_dirty` is kept.
    pub fn clear(&mut self) {
        self.new_objects.clear();
        self.dirty_objects.clear();
        self.detached_objects.clear();
        self.reattached_objects.clear();
        self.discarded_objects.clear();
        self.revision_deltas.clear();
        self.base_new_objects.clear();
        self.reattached_from.clear();
    }

    /// Removes every trace of `id`; used when it is committed or remapped.
    pub(crate) fn forget(&mut self, id: ObjectId) {
        self.new_objects.remove(&id);
        self.dirty_objects.remove(&id);
        self.detached_objects.remove(&id);
        self.reattached_objects.remove(&id);
        self.discarded_objects.remove(&id);
        self.revision_deltas.remove(&id);
        self.base_new_objects.remove(&id);
        self.reattached_from.remove(&id);
    }

    /// Every ID this savepoint mentions.
    pub(crate) fn touched(&self) -> BTreeSet<ObjectId> {
        let mut ids = BTreeSet::new();
        ids.extend(self.new_objects.iter().copied());
        ids.extend(self.dirty_objects.iter().copied());
        ids.extend(self.detached_objects.iter().copied());
        ids.extend(self.reattached_objects.iter().copied());
        ids.extend(self.discarded_objects.iter().copied());
        ids.extend(self.revision_deltas.keys().copied());
        ids
    }
}

/// Result of one first-to-last walk over the chain.
#[derive(Debug, Default)]
struct Walk {
    new: BTreeSet<ObjectId>,
    detached: BTreeSet<ObjectId>,
}

impl SavepointChain<ChangeLog> {
    fn walk(&self) -> Walk {
        let mut walk = Walk::default();
        for log in self.iter() {
            walk.new.extend(log.new_objects.iter().copied());
            for id in log.detached_objects.difference(&log.reattached_objects) {
                // Detaching an object that never reached the repository
                // just forgets it.
                if !walk.new.remove(id) {
                    walk.detached.insert(*id);
                }
            }
            for id in &log.reattached_objects {
                walk.detached.remove(id);
            }
        }
        walk
    }

    /// Objects created in the transaction and still attached.
    #[must_use]
    pub fn all_new_objects(&self) -> BTreeSet<ObjectId> {
        self.walk().new
    }

    /// Persistent objects detached in the transaction and not reattached.
    #[must_use]
    pub fn all_detached_objects(&self) -> BTreeSet<ObjectId> {
        self.walk().detached
    }

    /// Persistent objects modified in the transaction and still attached.
    #[must_use]
    pub fn all_dirty_objects(&self) -> BTreeSet<ObjectId> {
        let detached = self.all_detached_objects();
        self.iter()
            .flat_map(|log| log.dirty_objects.iter().copied())
            .filter(|id| !detached.contains(id) && !self.was_created_here(*id))
            .collect()
    }

    /// Deltas of persistent objects, merged across savepoints.
    ///
    /// Objects created in the transaction are skipped; their full revision
    /// is sent instead.
    #[must_use]
    pub fn all_revision_deltas(&self) -> BTreeMap<ObjectId, RevisionDelta> {
        let detached = self.all_detached_objects();
        let mut all: BTreeMap<ObjectId, RevisionDelta> = BTreeMap::new();
        for log in self.iter() {
            for (id, delta) in &log.revision_deltas {
                if detached.contains(id) || self.was_created_here(*id) {
                    continue;
                }
                all.entry(*id)
                    .and_modify(|merged| merged.merge(delta))
                    .or_insert_with(|| delta.clone());
            }
        }
        all
    }

    /// Latest base snapshot of `id` recorded before savepoint `before`,
    /// with the index of the savepoint holding it.
    #[must_use]
    pub fn latest_base_snapshot(&self, id: ObjectId, before: usize) -> Option<(usize, &Revision)> {
        self.iter()
            .take(before)
            .enumerate()
            .rev()
            .find_map(|(index, log)| log.base_new_objects.get(&id).map(|rev| (index, rev)))
    }

    /// Deltas of `id` recorded in savepoints `from..to`, merged.
    #[must_use]
    pub fn merged_delta(&self, id: ObjectId, from: usize, to: usize) -> Option<RevisionDelta> {
        let mut merged: Option<RevisionDelta> = None;
        for log in self.iter().take(to).skip(from) {
            if let Some(delta) = log.revision_deltas.get(&id) {
                match merged.as_mut() {
                    Some(m) => m.merge(delta),
                    None => merged = Some(delta.clone()),
                }
            }
        }
        merged
    }

    /// Returns true if `id` is a new object of this transaction that is
    /// currently attached.
    ///
    /// Savepoints are searched from last to first; the most recent record
    /// of the ID decides. Without any record, temporary IDs count as new.
    #[must_use]
    pub fn is_new_object(&self, id: ObjectId) -> bool {
        for log in self.iter().rev() {
            if log.new_objects.contains(&id) {
                return true;
            }
            if log.discarded_objects.contains(&id)
                || (log.detached_objects.contains(&id) && !log.reattached_objects.contains(&id))
            {
                return false;
            }
        }
        id.is_temporary()
    }

    /// Returns true if `id` was created by this transaction, whether or not
    /// it is still attached.
    #[must_use]
    pub fn was_created_here(&self, id: ObjectId) -> bool {
        id.is_temporary()
            || self
                .iter()
                .any(|log| log.new_objects.contains(&id) || log.discarded_objects.contains(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionId;
    use proptest::prelude::*;
    use revtx_model::{BranchId, FeatureDelta, FeatureValue, Version};

    fn chain() -> SavepointChain<ChangeLog> {
        SavepointChain::new(TransactionId::new(1))
    }

    fn set_delta(id: ObjectId, value: i64) -> RevisionDelta {
        let mut delta = RevisionDelta::new(id, BranchId::MAIN, Version::FIRST);
        delta.add_feature_delta(FeatureDelta::Set {
            feature: "name".into(),
            value: FeatureValue::Int(value),
            old_value: None,
        });
        delta
    }

    #[test]
    fn later_detach_removes_earlier_new_object() {
        let mut chain = chain();
        let id = ObjectId::temp(1);
        chain.last_mut().new_objects.insert(id);
        chain.push();
        chain.last_mut().detached_objects.insert(id);

        assert!(chain.all_new_objects().is_empty());
        assert!(chain.all_detached_objects().is_empty());
        assert!(!chain.is_new_object(id));
    }

    #[test]
    fn reattach_reverses_detach() {
        let mut chain = chain();
        let id = ObjectId::permanent(9);
        chain.last_mut().detached_objects.insert(id);
        assert_eq!(chain.all_detached_objects(), BTreeSet::from([id]));

        chain.push();
        chain.last_mut().reattached_objects.insert(id);
        assert!(chain.all_detached_objects().is_empty());
    }

    #[test]
    fn detach_and_reattach_in_same_savepoint_cancel_out() {
        let mut chain = chain();
        let id = ObjectId::permanent(9);
        chain.last_mut().detached_objects.insert(id);
        chain.last_mut().reattached_objects.insert(id);
        assert!(chain.all_detached_objects().is_empty());
    }

    #[test]
    fn deltas_merge_across_savepoints() {
        let mut chain = chain();
        let id = ObjectId::permanent(3);
        chain.last_mut().revision_deltas.insert(id, set_delta(id, 1));
        chain.push();
        chain.last_mut().revision_deltas.insert(id, set_delta(id, 2));

        let all = chain.all_revision_deltas();
        let merged = &all[&id];
        assert_eq!(merged.feature_deltas().len(), 1);
        assert!(matches!(
            &merged.feature_deltas()[0],
            FeatureDelta::Set { value: FeatureValue::Int(2), .. }
        ));
    }

    #[test]
    fn deltas_of_new_objects_are_skipped() {
        let mut chain = chain();
        let id = ObjectId::temp(1);
        chain.last_mut().new_objects.insert(id);
        chain.push();
        chain.last_mut().revision_deltas.insert(id, set_delta(id, 1));

        assert!(chain.all_revision_deltas().is_empty());
    }

    #[test]
    fn deltas_of_detached_objects_are_skipped() {
        let mut chain = chain();
        let id = ObjectId::permanent(3);
        chain.last_mut().revision_deltas.insert(id, set_delta(id, 1));
        chain.last_mut().dirty_objects.insert(id);
        chain.push();
        chain.last_mut().detached_objects.insert(id);

        assert!(chain.all_revision_deltas().is_empty());
        assert!(chain.all_dirty_objects().is_empty());
    }

    #[test]
    fn latest_base_snapshot_before_index_wins() {
        use revtx_model::ClassInfo;
        use std::sync::Arc;

        let class = Arc::new(ClassInfo::new("p", "C"));
        let id = ObjectId::temp(1);
        let first = Revision::new(id, Arc::clone(&class), BranchId::MAIN);
        let mut second = first.clone();
        second.set_version(Version::new(5));

        let mut chain = chain();
        chain.last_mut().base_new_objects.insert(id, first.clone());
        chain.push();
        chain.last_mut().base_new_objects.insert(id, second.clone());
        chain.push();

        assert_eq!(chain.latest_base_snapshot(id, 3), Some((1, &second)));
        assert_eq!(chain.latest_base_snapshot(id, 1), Some((0, &first)));
        assert_eq!(chain.latest_base_snapshot(id, 0), None);
    }

    #[test]
    fn merged_delta_covers_index_range() {
        let mut chain = chain();
        let id = ObjectId::permanent(3);
        chain.last_mut().revision_deltas.insert(id, set_delta(id, 1));
        chain.push();
        chain.push();
        chain.last_mut().revision_deltas.insert(id, set_delta(id, 2));

        assert!(chain.merged_delta(id, 1, 2).is_none());
        let merged = chain.merged_delta(id, 0, 3).unwrap();
        assert!(matches!(
            &merged.feature_deltas()[0],
            FeatureDelta::Set { value: FeatureValue::Int(2), .. }
        ));
    }

    #[test]
    fn permanent_id_without_record_is_not_new() {
        let chain = chain();
        assert!(!chain.is_new_object(ObjectId::permanent(1)));
        assert!(chain.is_new_object(ObjectId::temp(1)));
    }

    #[test]
    fn clear_keeps_was_dirty() {
        let mut log = ChangeLog {
            was_dirty: true,
            ..ChangeLog::default()
        };
        log.new_objects.insert(ObjectId::temp(1));
        log.clear();
        assert!(log.is_empty());
        assert!(log.was_dirty());
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Create(u32),
        Detach(u32),
        Reattach(u32),
        Savepoint,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (1u32..6).prop_map(Step::Create),
            (1u32..6).prop_map(Step::Detach),
            (1u32..6).prop_map(Step::Reattach),
            Just(Step::Savepoint),
        ]
    }

    /// Replays steps with the same bookkeeping rules the transaction uses.
    fn replay(steps: &[Step]) -> SavepointChain<ChangeLog> {
        let mut chain = chain();
        let mut created = BTreeSet::new();
        let mut attached = BTreeSet::new();
        for step in steps {
            match *step {
                Step::Create(n) => {
                    let id = ObjectId::temp(n);
                    if created.insert(id) {
                        attached.insert(id);
                        chain.last_mut().new_objects.insert(id);
                    }
                }
                Step::Detach(n) => {
                    let id = ObjectId::temp(n);
                    if attached.remove(&id) {
                        let log = chain.last_mut();
                        log.reattached_objects.remove(&id);
                        if log.new_objects.remove(&id) {
                            log.discarded_objects.insert(id);
                        } else {
                            log.detached_objects.insert(id);
                        }
                    }
                }
                Step::Reattach(n) => {
                    let id = ObjectId::temp(n);
                    if created.contains(&id) && attached.insert(id) {
                        let log = chain.last_mut();
                        log.discarded_objects.remove(&id);
                        log.reattached_objects.insert(id);
                        log.new_objects.insert(id);
                    }
                }
                Step::Savepoint => {
                    chain.push();
                }
            }
        }
        chain
    }

    proptest! {
        #[test]
        fn new_objects_are_never_left_detached(steps in prop::collection::vec(step(), 0..40)) {
            let chain = replay(&steps);
            let all_new = chain.all_new_objects();
            let logs: Vec<_> = chain.iter().collect();
            for id in &all_new {
                for (i, log) in logs.iter().enumerate() {
                    if log.detached_objects.contains(id) {
                        let reattached = logs[i..].iter().any(|l| l.reattached_objects.contains(id));
                        prop_assert!(reattached, "{id} detached in savepoint {i} without reattach");
                    }
                }
            }
        }

        #[test]
        fn is_new_object_tracks_attachment(steps in prop::collection::vec(step(), 0..40)) {
            let chain = replay(&steps);
            let all_new = chain.all_new_objects();
            for n in 1u32..6 {
                let id = ObjectId::temp(n);
                let created = steps.iter().any(|s| matches!(s, Step::Create(m) if *m == n));
                if created {
                    prop_assert_eq!(chain.is_new_object(id), all_new.contains(&id));
                }
            }
        }
    }

    #[test]
    fn detach_then_reattach_is_new_again() {
        let chain = replay(&[
            Step::Create(1),
            Step::Savepoint,
            Step::Detach(1),
            Step::Reattach(1),
        ]);
        assert!(chain.is_new_object(ObjectId::temp(1)));

        let chain = replay(&[Step::Create(1), Step::Savepoint, Step::Detach(1)]);
        assert!(!chain.is_new_object(ObjectId::temp(1)));
    }
}
