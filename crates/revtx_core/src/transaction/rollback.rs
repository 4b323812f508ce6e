//! Rollback to a savepoint.
//!
//! Savepoints after the target are undone last to first, restoring the
//! arena entries they created, detached or reattached. The object contents
//! are then rebuilt from what is left on the chain: new objects from their
//! latest base snapshot, dirty objects from their clean revision, each
//! replayed with the remaining deltas.

use super::state::TransactionState;
use crate::error::CoreResult;
use crate::object::{ObjectEvent, ObjectState};
use crate::savepoint::ChangeLog;
use revtx_model::ObjectId;
use std::collections::BTreeSet;
use tracing::{debug, warn};

impl TransactionState {
    /// Rolls back every savepoint from `index` on and leaves `index` as the
    /// empty last savepoint.
    pub(crate) fn rollback_to_index(&mut self, index: usize) -> CoreResult<()> {
        let mut touched = BTreeSet::new();
        for k in (index..self.chain.len()).rev() {
            let Some(log) = self.chain.get_mut(k).map(std::mem::take) else {
                continue;
            };
            touched.extend(log.touched());
            self.undo(log);
        }
        self.chain.truncate_after(index);
        // `undo` left `dirty` as it was when the target savepoint was set.
        self.chain.last_mut().was_dirty = self.dirty;

        self.replay(index, &touched)?;

        let referenced: BTreeSet<ObjectId> = self.chain.iter().flat_map(ChangeLog::touched).collect();
        for id in &touched {
            let dead = self.objects.get(*id).is_some_and(|o| !o.state.is_live());
            if dead && !referenced.contains(id) {
                self.objects.remove(*id);
            }
        }

        let keep: BTreeSet<ObjectId> = self
            .chain
            .all_dirty_objects()
            .into_iter()
            .chain(self.chain.all_detached_objects())
            .collect();
        self.clean_revisions.retain(|id, _| keep.contains(id));
        if index == 0 {
            self.lobs.clear();
        }
        debug!(transaction = %self.id, savepoint = index, objects = touched.len(), "rolled back");
        Ok(())
    }

    /// Restores the arena to what it was before `log` was recorded.
    fn undo(&mut self, log: ChangeLog) {
        let was_dirty = log.was_dirty;
        for (id, snapshot) in log.reattached_from {
            debug_assert_eq!(snapshot.id, id);
            self.objects.insert(snapshot);
        }
        for id in &log.detached_objects {
            if let Some(object) = self.objects.get_mut(*id) {
                if object.state == ObjectState::Detached {
                    object.state = object.pre_detach_state.take().unwrap_or(ObjectState::Clean);
                    if let Some(links) = object.detached_links.take() {
                        links.restore(&mut object.revision);
                    }
                    object.stashed_delta = None;
                }
            }
        }
        for id in log.new_objects.difference(&log.reattached_objects) {
            self.objects.remove(*id);
        }
        for id in &log.discarded_objects {
            self.objects.remove(*id);
        }
        self.dirty = was_dirty;
    }

    /// Rebuilds the touched objects from the savepoints `0..index`.
    fn replay(&mut self, index: usize, touched: &BTreeSet<ObjectId>) -> CoreResult<()> {
        let all_new = self.chain.all_new_objects();
        let all_dirty = self.chain.all_dirty_objects();

        for id in touched.intersection(&all_new) {
            if self.objects.state_of(*id) != Some(ObjectState::New) {
                continue;
            }
            let (from, mut revision) = match self.chain.latest_base_snapshot(*id, index) {
                Some((at, base)) => (at + 1, base.clone()),
                None => {
                    warn!(transaction = %self.id, object = %id, "new object has no base snapshot");
                    continue;
                }
            };
            if let Some(delta) = self.chain.merged_delta(*id, from, index) {
                self.merge_delta(&mut revision, &delta)?;
            }
            if let Some(object) = self.objects.get_mut(*id) {
                object.revision = revision;
            }
        }

        for id in touched {
            if all_new.contains(id) || self.chain.was_created_here(*id) {
                continue;
            }
            let Some(object) = self.objects.live(*id) else {
                continue;
            };
            if all_dirty.contains(id) {
                let Some(clean) = self.clean_revisions.get(id).cloned() else {
                    continue;
                };
                let mut revision = clean;
                if let Some(delta) = self.chain.merged_delta(*id, 0, index) {
                    self.merge_delta(&mut revision, &delta)?;
                }
                if object.state == ObjectState::Clean {
                    self.objects.fire(*id, ObjectEvent::Write)?;
                }
                if let Some(object) = self.objects.get_mut(*id) {
                    object.revision = revision;
                }
            } else {
                self.revert_to_clean(*id)?;
            }
        }
        Ok(())
    }

    /// Drops local changes of a persistent object.
    ///
    /// A conflicting object adopts the remote revision that caused the
    /// conflict, which resolves it.
    fn revert_to_clean(&mut self, id: ObjectId) -> CoreResult<()> {
        let clean = self.clean_revisions.remove(&id);
        self.objects.fire(id, ObjectEvent::Rollback)?;
        let conflicting = self.objects.get(id).is_some_and(|o| o.conflict);
        if let Some(object) = self.objects.get_mut(id) {
            match object.remote_revision.take() {
                Some(remote) => object.revision = remote,
                None => {
                    if let Some(clean) = clean {
                        object.revision = clean;
                    }
                }
            }
        }
        if conflicting {
            if let Some(object) = self.objects.get_mut(id) {
                object.conflict = false;
            }
            self.conflicts = self.conflicts.saturating_sub(1);
        }
        Ok(())
    }
}
