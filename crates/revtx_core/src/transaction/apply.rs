//! Replaying deltas and change sets into a transaction.
//!
//! Deltas recorded against one state of an object are often replayed onto
//! a slightly different one: a savepoint rebuilt after a remote update, a
//! change set merged from another transaction. List changes are therefore
//! replayed by value where their recorded index no longer matches.

use super::events::{ObjectChange, TransactionEvent};
use super::state::TransactionState;
use crate::error::{CoreError, CoreResult};
use crate::object::{ObjectEvent, ObjectState};
use revtx_model::{
    ChangeSetData, FeatureDelta, FeatureValue, IdMapper, ObjectId, Revision, RevisionDelta,
    RevisionProvider, Version,
};
use tracing::{debug, warn};

impl TransactionState {
    /// Applies `delta` to `revision`, strictly if possible.
    ///
    /// When the strict apply fails (an index drifted) the delta is replayed
    /// with [`replay_delta`](Self::replay_delta) instead.
    pub(crate) fn merge_delta(&self, revision: &mut Revision, delta: &RevisionDelta) -> CoreResult<()> {
        let mut attempt = revision.clone();
        match delta.apply(&mut attempt) {
            Ok(()) => {
                *revision = attempt;
                Ok(())
            }
            Err(err) => {
                warn!(
                    transaction = %self.id,
                    object = %revision.id(),
                    error = %err,
                    "strict delta apply failed, replaying by value"
                );
                self.replay_delta(revision, delta)
            }
        }
    }

    /// Replays `delta` onto `revision`, tolerating drifted list indices.
    ///
    /// The revision is left untouched if the replay fails.
    pub(crate) fn replay_delta(&self, revision: &mut Revision, delta: &RevisionDelta) -> CoreResult<()> {
        let mut work = revision.clone();
        for change in delta.feature_deltas() {
            match change {
                FeatureDelta::List { feature, changes } => {
                    self.replay_list(&mut work, feature, changes)?;
                }
                change if change.is_list_change() => {
                    self.replay_list(&mut work, change.feature(), std::slice::from_ref(change))?;
                }
                change => change.apply(&mut work)?,
            }
        }
        *revision = work;
        Ok(())
    }

    fn replay_list(&self, revision: &mut Revision, feature: &str, changes: &[FeatureDelta]) -> CoreResult<()> {
        let id = revision.id();
        let info = revision.feature_info(feature)?.clone();
        let list = revision.list_mut(feature)?;
        // Stored and actual index of the last remove; a move right after a
        // drifted remove targets the actual slot.
        let mut last_remove: Option<(usize, usize)> = None;

        for change in changes {
            match change {
                FeatureDelta::Add { index, value, .. } => {
                    if info.unique && list.contains(value) {
                        continue;
                    }
                    if value.as_id().is_some_and(|target| !self.exists(target)) {
                        continue;
                    }
                    list.insert((*index).min(list.len()), value.clone());
                }
                FeatureDelta::Remove { index, value, .. } => {
                    if let Some(actual) = locate(list, *index, value) {
                        list.remove(actual);
                        last_remove = Some((*index, actual));
                    }
                }
                FeatureDelta::Move {
                    old_position,
                    new_position,
                    value,
                    ..
                } => {
                    let Some(from) = locate(list, *old_position, value) else {
                        continue;
                    };
                    let to = match last_remove {
                        Some((stored, actual)) if stored == *new_position => actual,
                        _ => *new_position,
                    };
                    let moved = list.remove(from);
                    list.insert(to.min(list.len()), moved);
                }
                FeatureDelta::Clear { .. } => list.clear(),
                other => {
                    debug!(object = %id, feature, change = ?other, "ignoring non-list change inside list delta");
                }
            }
        }

        if info.is_reference() {
            if list.iter().any(|v| v.as_id().is_none()) {
                return Err(CoreError::InvalidListElement {
                    id,
                    feature: feature.to_owned(),
                });
            }
            if info.unique {
                let mut seen = Vec::with_capacity(list.len());
                list.retain(|v| {
                    if seen.contains(v) {
                        false
                    } else {
                        seen.push(v.clone());
                        true
                    }
                });
            }
            list.retain(|v| v.as_id().map_or(true, |target| self.exists(target)));
        }
        Ok(())
    }

    /// Merges a change set into a clean transaction.
    ///
    /// New objects not present yet are attached under their own IDs,
    /// deltas are replayed onto the local objects and detached objects are
    /// detached. Objects the transaction does not know are skipped.
    pub(crate) fn apply_change_set_data(&mut self, data: &ChangeSetData) -> CoreResult<Vec<ObjectChange>> {
        self.check_writable()?;
        if self.dirty {
            return Err(CoreError::DirtyMerge);
        }
        let mut changes = Vec::new();

        for revision in &data.new_objects {
            if self.objects.is_live(revision.id()) {
                debug!(transaction = %self.id, object = %revision.id(), "new object already present");
                continue;
            }
            self.attach_new(revision.clone())?;
            changes.push(ObjectChange {
                id: revision.id(),
                old: None,
                new: Some(revision.clone()),
            });
        }

        for delta in &data.changed_objects {
            let id = delta.id();
            let Some(object) = self.objects.live(id) else {
                warn!(transaction = %self.id, object = %id, "change set touches an unknown object");
                continue;
            };
            let old = object.revision.clone();
            let mut new = old.clone();
            self.replay_delta(&mut new, delta)?;
            if new == old {
                continue;
            }
            self.replace_revision(id, new.clone())?;
            changes.push(ObjectChange {
                id,
                old: Some(old),
                new: Some(new),
            });
        }

        for detached in &data.detached_objects {
            let Some(object) = self.objects.live(detached.id) else {
                continue;
            };
            let old = object.revision.clone();
            self.detach(detached.id)?;
            changes.push(ObjectChange {
                id: detached.id,
                old: Some(old),
                new: None,
            });
        }

        debug!(transaction = %self.id, objects = changes.len(), "change set data applied");
        if !changes.is_empty() {
            self.events.push(TransactionEvent::ObjectsChanged(changes.clone()));
        }
        Ok(changes)
    }

    /// Swaps in a new revision of a live object and records the difference.
    pub(crate) fn replace_revision(&mut self, id: ObjectId, new: Revision) -> CoreResult<()> {
        let object = self.objects.require_live(id)?;
        let old = object.revision.clone();
        let before = object.state;
        if before == ObjectState::Clean {
            self.clean_revisions.insert(id, old.clone());
        }
        self.objects.fire(id, ObjectEvent::Write)?;
        self.objects.require_live_mut(id)?.revision = new.clone();
        if before == ObjectState::Clean {
            self.register_dirty(id)?;
        }
        for change in new.compare(&old).feature_deltas() {
            self.register_feature_delta(id, change.clone());
        }
        Ok(())
    }

    /// Applies a change set computed against `base` to this transaction.
    ///
    /// Each changed object is driven to `base` plus the change set's delta
    /// through ordinary edits, so the result is recorded like user edits.
    /// With `keep_versions`, a delta whose version differs from the local
    /// object fails the whole call before anything is changed.
    pub(crate) fn apply_change_set(
        &mut self,
        data: &ChangeSetData,
        base: &dyn RevisionProvider,
        keep_versions: bool,
    ) -> CoreResult<Vec<ObjectChange>> {
        self.check_writable()?;
        if keep_versions {
            for delta in &data.changed_objects {
                if let Some(local) = self.objects.live(delta.id()) {
                    let actual = local.revision.version();
                    if actual != delta.version() {
                        return Err(CoreError::ChangeSetOutdated {
                            id: delta.id(),
                            expected: delta.version(),
                            actual,
                        });
                    }
                }
            }
        }

        let mut changes = Vec::new();
        for revision in &data.new_objects {
            let id = revision.id();
            if self.objects.state_of(id) == Some(ObjectState::Detached) {
                self.reattach(id)?;
            } else if !self.objects.is_live(id) {
                self.attach_new(revision.clone())?;
            } else {
                continue;
            }
            changes.push(ObjectChange {
                id,
                old: None,
                new: self.objects.live(id).map(|o| o.revision.clone()),
            });
        }

        for delta in &data.changed_objects {
            let id = delta.id();
            let Some(local) = self.objects.live(id).map(|o| o.revision.clone()) else {
                warn!(transaction = %self.id, object = %id, "change set touches an unknown object");
                continue;
            };
            let Some(mut goal) = base.revision(id) else {
                warn!(transaction = %self.id, object = %id, "no base revision for change set delta");
                continue;
            };
            self.replay_delta(&mut goal, delta)?;
            let edits = goal.compare(&local);
            if edits.is_empty() {
                continue;
            }
            for change in edits.feature_deltas() {
                self.write(id, change.clone())?;
            }
            changes.push(ObjectChange {
                id,
                old: Some(local),
                new: self.objects.live(id).map(|o| o.revision.clone()),
            });
        }

        for detached in &data.detached_objects {
            let Some(old) = self.objects.live(detached.id).map(|o| o.revision.clone()) else {
                continue;
            };
            self.detach(detached.id)?;
            changes.push(ObjectChange {
                id: detached.id,
                old: Some(old),
                new: None,
            });
        }

        if !changes.is_empty() {
            self.events.push(TransactionEvent::ObjectsChanged(changes.clone()));
        }
        Ok(changes)
    }

    /// Undoes a change set previously applied on top of `base`.
    ///
    /// Detached objects come back, either by reattaching them or, when the
    /// transaction no longer has them, as new objects with fresh IDs.
    /// Changed objects return to their base revision and the change set's
    /// new objects are detached.
    pub(crate) fn revert_change_set_data(
        &mut self,
        data: &ChangeSetData,
        base: &dyn RevisionProvider,
    ) -> CoreResult<Vec<ObjectChange>> {
        self.check_writable()?;
        let mut changes = Vec::new();
        let mut mapper = IdMapper::new();
        let mut recreate = Vec::new();

        for detached in &data.detached_objects {
            let id = detached.id;
            match self.objects.state_of(id) {
                Some(ObjectState::Detached) => {
                    self.reattach(id)?;
                    changes.push(ObjectChange {
                        id,
                        old: None,
                        new: self.objects.live(id).map(|o| o.revision.clone()),
                    });
                }
                Some(state) if state.is_live() => {}
                _ => {
                    if let Some(revision) = base.revision(id) {
                        mapper.insert(id, self.ids.next_id());
                        recreate.push(revision);
                    }
                }
            }
        }

        for mut revision in recreate {
            let id = mapper.get(revision.id()).unwrap_or(revision.id());
            revision.set_id(id);
            revision.set_version(Version::UNSPECIFIED);
            revision.adjust_references(&mapper);
            self.attach_new(revision.clone())?;
            changes.push(ObjectChange {
                id,
                old: None,
                new: Some(revision),
            });
        }

        for delta in &data.changed_objects {
            let id = delta.id();
            let Some(local) = self.objects.live(id).map(|o| o.revision.clone()) else {
                continue;
            };
            let Some(mut goal) = base.revision(id) else {
                warn!(transaction = %self.id, object = %id, "no base revision to revert to");
                continue;
            };
            goal.adjust_references(&mapper);
            let edits = goal.compare(&local);
            for change in edits.feature_deltas() {
                self.write(id, change.clone())?;
            }
            if !edits.is_empty() {
                changes.push(ObjectChange {
                    id,
                    old: Some(local),
                    new: self.objects.live(id).map(|o| o.revision.clone()),
                });
            }
        }

        for revision in &data.new_objects {
            let id = revision.id();
            let Some(old) = self.objects.live(id).map(|o| o.revision.clone()) else {
                continue;
            };
            self.detach(id)?;
            changes.push(ObjectChange {
                id,
                old: Some(old),
                new: None,
            });
        }

        if !changes.is_empty() {
            self.events.push(TransactionEvent::ObjectsChanged(changes.clone()));
        }
        Ok(changes)
    }
}

/// Index of `value` in `list`, preferring `hint`.
fn locate(list: &[FeatureValue], hint: usize, value: &FeatureValue) -> Option<usize> {
    if list.get(hint) == Some(value) {
        Some(hint)
    } else {
        list.iter().position(|v| v == value)
    }
}
