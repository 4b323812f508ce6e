//! Preparing a commit and applying its result.

use super::events::{FinishKind, ObjectEditor, TransactionEvent, TransactionHandler};
use super::state::TransactionState;
use crate::commit::{integrity, CommitContext};
use crate::config::TransactionConfig;
use crate::error::{CoreError, CoreResult};
use crate::object::ObjectEvent;
use revtx_model::{ChangeSetData, IdAndVersion, IdMapper, ObjectId, Version};
use revtx_protocol::{CommitInfo, CommitTransactionResult};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

impl TransactionState {
    /// Builds the context of the next commit.
    ///
    /// Returns `None` if there is nothing to commit.
    pub(crate) fn prepare_commit(
        &mut self,
        config: &TransactionConfig,
        handlers: &[Arc<dyn TransactionHandler>],
    ) -> CoreResult<Option<CommitContext>> {
        self.check_writable()?;
        if !self.dirty {
            return Ok(None);
        }
        if config.reject_conflicting_commits && self.conflicts > 0 {
            return Err(CoreError::ConflictsPending {
                count: self.conflicts,
            });
        }

        if !handlers.is_empty() {
            let mut editor = ObjectEditor::new(self);
            for handler in handlers {
                handler.committing(&mut editor)?;
            }
            if editor.modified() {
                debug!(transaction = %self.id, "commit handlers edited objects");
            }
        }

        let context = CommitContext::build(self);
        if context.is_empty() && !context.is_partial_commit() {
            // Everything created here was discarded again.
            self.finish_without_changes();
            return Ok(None);
        }
        if context.is_partial_commit() {
            integrity::check(self, &context, config.integrity_style)?;
        }
        Ok(Some(context))
    }

    fn finish_without_changes(&mut self) {
        self.chain.reset();
        self.clean_revisions.clear();
        self.objects.purge_retired();
        self.dirty = false;
        self.committables = None;
    }

    /// Applies a successful commit result.
    ///
    /// `foreign_mappings` carries the IDs other participants of the same
    /// distributed commit assigned; references to those objects are
    /// rewritten too.
    pub(crate) fn post_commit(
        &mut self,
        context: &mut CommitContext,
        result: &CommitTransactionResult,
        foreign_mappings: &HashMap<ObjectId, ObjectId>,
        config: &TransactionConfig,
    ) -> CoreResult<CommitInfo> {
        let mut mapper = result.reference_adjuster();
        for (from, to) in foreign_mappings {
            mapper.insert(*from, *to);
        }
        let partial = context.is_partial_commit();
        let point = result.branch_point;

        for (from, to) in &result.id_mappings {
            self.objects.remap(*from, *to);
            if let Some(mut lock) = self.lock_states.remove(from) {
                lock.adjust_target(&mapper);
                self.lock_states.insert(*to, lock);
            }
        }

        let new_ids: Vec<ObjectId> = context
            .new_objects()
            .keys()
            .map(|id| mapper.get(*id).unwrap_or(*id))
            .collect();
        for id in &new_ids {
            self.objects.fire(*id, ObjectEvent::Commit)?;
            if let Some(object) = self.objects.get_mut(*id) {
                object.revision.set_version(Version::FIRST);
                object.revision.set_branch_point(point);
            }
        }

        let dirty_ids: BTreeSet<ObjectId> = context
            .dirty_objects()
            .keys()
            .chain(context.revision_deltas().keys())
            .copied()
            .collect();
        for id in &dirty_ids {
            let base = self
                .clean_revisions
                .get(id)
                .map(|clean| clean.version())
                .or_else(|| self.objects.get(*id).map(|o| o.revision.version()))
                .unwrap_or_default();
            self.objects.fire(*id, ObjectEvent::Commit)?;
            if let Some(object) = self.objects.get_mut(*id) {
                object.revision.set_version(base.next());
                object.revision.set_branch_point(point);
            }
        }

        for object in self.objects.all_mut() {
            object.revision.adjust_references(&mapper);
            if let Some(remote) = object.remote_revision.as_mut() {
                remote.adjust_references(&mapper);
            }
        }
        for clean in self.clean_revisions.values_mut() {
            clean.adjust_references(&mapper);
        }

        let detached: Vec<(ObjectId, Version)> = context
            .detached_objects()
            .iter()
            .map(|(id, version)| (*id, *version))
            .collect();
        for (id, _) in &detached {
            self.objects.fire(*id, ObjectEvent::Commit)?;
            self.objects.remove(*id);
            self.clean_revisions.remove(id);
        }

        self.packages.mark_loaded(context.new_package_units());
        for lob in context.lobs() {
            self.lobs.remove(&lob.id());
        }

        if partial {
            let committed: Vec<ObjectId> = context
                .new_objects()
                .keys()
                .copied()
                .chain(new_ids.iter().copied())
                .chain(dirty_ids.iter().copied())
                .chain(detached.iter().map(|(id, _)| *id))
                .collect();
            for log in self.chain.iter_mut() {
                for id in &committed {
                    log.forget(*id);
                }
                remap_log(log, &mapper);
            }
            for id in &dirty_ids {
                self.clean_revisions.remove(id);
            }
            self.dirty = self.chain.iter().any(|log| !log.is_empty());
        } else {
            self.chain.reset();
            self.ids.reset();
            self.clean_revisions.clear();
            self.objects.purge_retired();
            self.dirty = false;
        }

        if config.auto_release_locks && !partial {
            self.lock_states.clear();
        }
        for lock in &result.new_lock_states {
            let id = lock.target().id();
            if lock.is_unlocked() {
                self.lock_states.remove(&id);
            } else {
                self.lock_states.insert(id, lock.clone());
            }
        }

        self.last_commit_time = point.timestamp;
        self.committables = None;
        let comment = self.comment.take().or_else(|| context.comment().map(str::to_owned));

        context.apply_result(&mapper);
        let change_set = ChangeSetData::new(
            new_ids
                .iter()
                .filter_map(|id| self.objects.get(*id).map(|o| o.revision.clone()))
                .collect(),
            context.revision_deltas().values().cloned().collect(),
            detached
                .iter()
                .map(|(id, version)| IdAndVersion::new(*id, *version))
                .collect(),
        );
        info!(
            transaction = %self.id,
            timestamp = point.timestamp.as_millis(),
            new = change_set.new_objects.len(),
            changed = change_set.changed_objects.len(),
            detached = change_set.detached_objects.len(),
            partial,
            "committed"
        );
        self.events.push(TransactionEvent::Finished {
            kind: FinishKind::Committed,
            id_mappings: result.id_mappings.clone(),
        });
        Ok(CommitInfo {
            branch_point: point,
            previous_timestamp: result.previous_timestamp,
            user_id: config.user_id.clone(),
            comment,
            change_set,
            id_mappings: result.id_mappings.clone(),
        })
    }
}

fn remap_log(log: &mut crate::savepoint::ChangeLog, mapper: &IdMapper) {
    for delta in log.revision_deltas.values_mut() {
        delta.adjust_references(mapper);
    }
    for revision in log.base_new_objects.values_mut() {
        revision.adjust_references(mapper);
    }
    for object in log.reattached_from.values_mut() {
        object.revision.adjust_references(mapper);
    }
}

#[cfg(test)]
mod tests {
    use super::super::state::tests::{folder_class, loaded, state};
    use super::*;
    use crate::object::ObjectState;
    use revtx_model::{BranchId, BranchPoint, FeatureValue, Timestamp};

    fn success() -> CommitTransactionResult {
        CommitTransactionResult::success(
            BranchPoint::new(BranchId::MAIN, Timestamp::new(100)),
            Timestamp::new(90),
        )
    }

    #[test]
    fn nothing_to_commit_without_changes() {
        let mut state = state();
        loaded(&mut state, 1);
        assert!(state
            .prepare_commit(&TransactionConfig::default(), &[])
            .unwrap()
            .is_none());
    }

    #[test]
    fn discarded_work_commits_nothing() {
        let mut state = state();
        let id = state.new_object(folder_class()).unwrap();
        state.detach(id).unwrap();
        assert!(state.dirty);
        assert!(state
            .prepare_commit(&TransactionConfig::default(), &[])
            .unwrap()
            .is_none());
        assert!(!state.dirty);
    }

    #[test]
    fn pending_conflicts_block_commit() {
        let mut state = state();
        let id = loaded(&mut state, 1);
        state.set_value(id, "name", "x".into()).unwrap();
        state.set_conflict(id);
        let err = state
            .prepare_commit(&TransactionConfig::default(), &[])
            .unwrap_err();
        assert!(matches!(err, CoreError::ConflictsPending { count: 1 }));
    }

    #[test]
    fn full_commit_remaps_and_resets() {
        let mut state = state();
        let holder = loaded(&mut state, 1);
        let id = state.new_object(folder_class()).unwrap();
        state.add_value(holder, "links", 0, FeatureValue::Ref(id)).unwrap();
        state.set_savepoint();

        let config = TransactionConfig::default();
        let mut context = state.prepare_commit(&config, &[]).unwrap().unwrap();
        let result = success().with_mapping(id, ObjectId::permanent(77));
        let info = state
            .post_commit(&mut context, &result, &HashMap::new(), &config)
            .unwrap();

        let permanent = ObjectId::permanent(77);
        let created = state.objects.get(permanent).unwrap();
        assert_eq!(created.state, ObjectState::Clean);
        assert_eq!(created.revision.version(), Version::FIRST);
        let holder = state.objects.get(holder).unwrap();
        assert_eq!(holder.state, ObjectState::Clean);
        assert_eq!(holder.revision.version(), Version::new(2));
        assert_eq!(holder.revision.list("links").unwrap(), &[FeatureValue::Ref(permanent)]);

        assert!(!state.dirty);
        assert_eq!(state.chain.len(), 1);
        assert_eq!(state.ids.last(), 0);
        assert_eq!(state.last_commit_time, Timestamp::new(100));
        assert_eq!(info.change_set.new_objects[0].id(), permanent);
        assert_eq!(context.lookup(permanent).map(|r| r.id()), Some(permanent));
    }

    #[test]
    fn partial_commit_leaves_rest_pending() {
        let mut state = state();
        let a = loaded(&mut state, 1);
        let b = loaded(&mut state, 2);
        state.set_value(a, "name", "a".into()).unwrap();
        state.set_value(b, "name", "b".into()).unwrap();
        state.committables = Some(BTreeSet::from([a]));

        let config = TransactionConfig::default();
        let mut context = state.prepare_commit(&config, &[]).unwrap().unwrap();
        assert!(context.is_partial_commit());
        state
            .post_commit(&mut context, &success(), &HashMap::new(), &config)
            .unwrap();

        assert!(state.dirty);
        assert_eq!(state.objects.state_of(a), Some(ObjectState::Clean));
        assert_eq!(state.objects.state_of(b), Some(ObjectState::Dirty));
        assert_eq!(state.chain.all_dirty_objects(), BTreeSet::from([b]));
        assert!(state.committables.is_none());
    }

    #[test]
    fn committed_detach_removes_object() {
        let mut state = state();
        let id = loaded(&mut state, 5);
        state.detach(id).unwrap();

        let config = TransactionConfig::default();
        let mut context = state.prepare_commit(&config, &[]).unwrap().unwrap();
        let info = state
            .post_commit(&mut context, &success(), &HashMap::new(), &config)
            .unwrap();
        assert!(state.objects.get(id).is_none());
        assert_eq!(info.change_set.detached_objects, vec![IdAndVersion::new(id, Version::FIRST)]);
    }
}
