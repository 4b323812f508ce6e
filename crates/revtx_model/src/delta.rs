//! Feature-level deltas between revisions.

use crate::adjust::ReferenceAdjuster;
use crate::error::{ModelError, ModelResult};
use crate::id::ObjectId;
use crate::revision::Revision;
use crate::types::{BranchId, Version};
use crate::value::FeatureValue;
use serde::{Deserialize, Serialize};

/// Pseudo feature name under which container changes are recorded.
pub const CONTAINER_FEATURE: &str = "$container";

/// One change to one feature of a revision.
///
/// List changes carry explicit indices. Those indices are exact when the
/// delta is applied to the revision it was recorded against and may be stale
/// when replayed onto a concurrently modified list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDelta {
    /// Replace a single-valued feature.
    Set {
        /// Feature name.
        feature: String,
        /// New value.
        value: FeatureValue,
        /// Value before the change, if it had one.
        old_value: Option<FeatureValue>,
    },
    /// Reset a feature to its default.
    Unset {
        /// Feature name.
        feature: String,
    },
    /// Insert into a list.
    Add {
        /// Feature name.
        feature: String,
        /// Insertion index.
        index: usize,
        /// Inserted value.
        value: FeatureValue,
    },
    /// Remove from a list.
    Remove {
        /// Feature name.
        feature: String,
        /// Index of the removed element.
        index: usize,
        /// Removed value, used to relocate the element if the index drifted.
        value: FeatureValue,
    },
    /// Move a list element.
    Move {
        /// Feature name.
        feature: String,
        /// Index before the move.
        old_position: usize,
        /// Index after the move.
        new_position: usize,
        /// Moved value.
        value: FeatureValue,
    },
    /// Empty a list.
    Clear {
        /// Feature name.
        feature: String,
    },
    /// Change the container, containing feature or resource.
    Container {
        /// New container.
        container: Option<ObjectId>,
        /// New containing feature.
        containing_feature: Option<String>,
        /// New direct resource.
        resource: Option<ObjectId>,
    },
    /// Ordered list changes on one list feature.
    List {
        /// Feature name.
        feature: String,
        /// Changes in application order.
        changes: Vec<FeatureDelta>,
    },
}

impl FeatureDelta {
    /// Returns the affected feature ([`CONTAINER_FEATURE`] for container changes).
    #[must_use]
    pub fn feature(&self) -> &str {
        match self {
            Self::Set { feature, .. }
            | Self::Unset { feature }
            | Self::Add { feature, .. }
            | Self::Remove { feature, .. }
            | Self::Move { feature, .. }
            | Self::Clear { feature }
            | Self::List { feature, .. } => feature,
            Self::Container { .. } => CONTAINER_FEATURE,
        }
    }

    /// Returns true for changes that belong inside a [`FeatureDelta::List`].
    #[must_use]
    pub fn is_list_change(&self) -> bool {
        matches!(
            self,
            Self::Add { .. } | Self::Remove { .. } | Self::Move { .. } | Self::Clear { .. }
        )
    }

    /// Applies this change to `revision`, failing on any index mismatch.
    pub fn apply(&self, revision: &mut Revision) -> ModelResult<()> {
        match self {
            Self::Set { feature, value, .. } => {
                revision.set(feature, value.clone())?;
            }
            Self::Unset { feature } => {
                revision.unset(feature)?;
            }
            Self::Add {
                feature,
                index,
                value,
            } => {
                let list = revision.list_mut(feature)?;
                check_index(feature, *index, list.len(), true)?;
                list.insert(*index, value.clone());
            }
            Self::Remove { feature, index, .. } => {
                let list = revision.list_mut(feature)?;
                check_index(feature, *index, list.len(), false)?;
                list.remove(*index);
            }
            Self::Move {
                feature,
                old_position,
                new_position,
                ..
            } => {
                let list = revision.list_mut(feature)?;
                check_index(feature, *old_position, list.len(), false)?;
                check_index(feature, *new_position, list.len(), false)?;
                let value = list.remove(*old_position);
                list.insert(*new_position, value);
            }
            Self::Clear { feature } => {
                revision.list_mut(feature)?.clear();
            }
            Self::Container {
                container,
                containing_feature,
                resource,
            } => {
                revision.set_container(*container, containing_feature.clone());
                revision.set_resource(*resource);
            }
            Self::List { changes, .. } => {
                for change in changes {
                    change.apply(revision)?;
                }
            }
        }
        Ok(())
    }

    /// Rewrites references carried by this change.
    pub fn adjust_references(&mut self, adjuster: &dyn ReferenceAdjuster) -> bool {
        match self {
            Self::Set {
                value, old_value, ..
            } => {
                let mut changed = value.adjust_references(adjuster);
                if let Some(old) = old_value {
                    changed |= old.adjust_references(adjuster);
                }
                changed
            }
            Self::Add { value, .. } | Self::Remove { value, .. } | Self::Move { value, .. } => {
                value.adjust_references(adjuster)
            }
            Self::Container {
                container,
                resource,
                ..
            } => {
                let mut changed = false;
                for link in [container, resource] {
                    if let Some(id) = link {
                        let adjusted = adjuster.adjust(*id);
                        changed |= adjusted != *id;
                        *id = adjusted;
                    }
                }
                changed
            }
            Self::List { changes, .. } => changes
                .iter_mut()
                .fold(false, |changed, c| c.adjust_references(adjuster) | changed),
            Self::Unset { .. } | Self::Clear { .. } => false,
        }
    }
}

fn check_index(feature: &str, index: usize, len: usize, insert: bool) -> ModelResult<()> {
    let in_bounds = if insert { index <= len } else { index < len };
    if !in_bounds {
        return Err(ModelError::IndexOutOfBounds {
            feature: feature.to_owned(),
            index,
            len,
        });
    }
    Ok(())
}

/// Computes list changes turning `old` into `new`.
///
/// Elements of `old` that no longer occur are removed in place, elements
/// that occur later are moved forward, and missing ones are inserted; any
/// surplus tail is removed last-to-first.
#[must_use]
pub fn list_difference(feature: &str, old: &[FeatureValue], new: &[FeatureValue]) -> Vec<FeatureDelta> {
    let mut work = old.to_vec();
    let mut changes = Vec::new();
    for (i, target) in new.iter().enumerate() {
        while i < work.len() && work[i] != *target && !new[i..].contains(&work[i]) {
            let value = work.remove(i);
            changes.push(FeatureDelta::Remove {
                feature: feature.to_owned(),
                index: i,
                value,
            });
        }
        if work.get(i) == Some(target) {
            continue;
        }
        let found = work
            .iter()
            .skip(i + 1)
            .position(|v| v == target)
            .map(|p| p + i + 1);
        match found {
            Some(j) => {
                let value = work.remove(j);
                work.insert(i, value.clone());
                changes.push(FeatureDelta::Move {
                    feature: feature.to_owned(),
                    old_position: j,
                    new_position: i,
                    value,
                });
            }
            None => {
                work.insert(i, target.clone());
                changes.push(FeatureDelta::Add {
                    feature: feature.to_owned(),
                    index: i,
                    value: target.clone(),
                });
            }
        }
    }
    while work.len() > new.len() {
        let index = work.len() - 1;
        if let Some(value) = work.pop() {
            changes.push(FeatureDelta::Remove {
                feature: feature.to_owned(),
                index,
                value,
            });
        }
    }
    changes
}

/// Ordered feature changes transforming one revision into the next.
///
/// At most one entry exists per single-valued feature (a later `Set`
/// replaces an earlier one), and list changes for one feature are kept in a
/// single [`FeatureDelta::List`] in recording order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionDelta {
    id: ObjectId,
    branch: BranchId,
    version: Version,
    feature_deltas: Vec<FeatureDelta>,
}

impl RevisionDelta {
    /// Creates an empty delta against the given base revision coordinates.
    #[must_use]
    pub fn new(id: ObjectId, branch: BranchId, version: Version) -> Self {
        Self {
            id,
            branch,
            version,
            feature_deltas: Vec::new(),
        }
    }

    /// Creates an empty delta against `revision`.
    #[must_use]
    pub fn for_revision(revision: &Revision) -> Self {
        Self::new(revision.id(), revision.branch(), revision.version())
    }

    /// Target object.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Replaces the target object ID.
    pub fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    /// Branch of the base revision.
    #[must_use]
    pub fn branch(&self) -> BranchId {
        self.branch
    }

    /// Version of the base revision.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Sets the base version.
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// The recorded changes.
    #[must_use]
    pub fn feature_deltas(&self) -> &[FeatureDelta] {
        &self.feature_deltas
    }

    /// Returns true if no change is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.feature_deltas.is_empty()
    }

    /// Records a change, merging it with earlier changes to the same feature.
    pub fn add_feature_delta(&mut self, delta: FeatureDelta) {
        if delta.is_list_change() {
            let feature = delta.feature().to_owned();
            self.push_list_changes(feature, vec![delta]);
            return;
        }
        match delta {
            FeatureDelta::List { feature, changes } => self.push_list_changes(feature, changes),
            FeatureDelta::Set {
                feature,
                value,
                old_value,
            } => {
                let existing = self.position_of_single(&feature);
                let old_value = match existing.map(|i| &self.feature_deltas[i]) {
                    Some(FeatureDelta::Set { old_value, .. }) => old_value.clone(),
                    _ => old_value,
                };
                self.replace_or_push(
                    existing,
                    FeatureDelta::Set {
                        feature,
                        value,
                        old_value,
                    },
                );
            }
            other => {
                let existing = self.position_of_single(other.feature());
                self.replace_or_push(existing, other);
            }
        }
    }

    fn position_of_single(&self, feature: &str) -> Option<usize> {
        self.feature_deltas.iter().position(|d| {
            matches!(
                d,
                FeatureDelta::Set { .. } | FeatureDelta::Unset { .. } | FeatureDelta::Container { .. }
            ) && d.feature() == feature
        })
    }

    fn replace_or_push(&mut self, position: Option<usize>, delta: FeatureDelta) {
        match position {
            Some(i) => self.feature_deltas[i] = delta,
            None => self.feature_deltas.push(delta),
        }
    }

    fn push_list_changes(&mut self, feature: String, mut changes: Vec<FeatureDelta>) {
        let existing = self.feature_deltas.iter_mut().find_map(|d| match d {
            FeatureDelta::List {
                feature: f,
                changes,
            } if *f == feature => Some(changes),
            _ => None,
        });
        match existing {
            Some(list) => list.append(&mut changes),
            None => self
                .feature_deltas
                .push(FeatureDelta::List { feature, changes }),
        }
    }

    /// Appends every change of `other`.
    pub fn merge(&mut self, other: &RevisionDelta) {
        for delta in &other.feature_deltas {
            self.add_feature_delta(delta.clone());
        }
    }

    /// Applies all changes to `revision` in order.
    pub fn apply(&self, revision: &mut Revision) -> ModelResult<()> {
        for delta in &self.feature_deltas {
            delta.apply(revision)?;
        }
        Ok(())
    }

    /// Rewrites the target ID and all carried references.
    pub fn adjust_references(&mut self, adjuster: &dyn ReferenceAdjuster) -> bool {
        let adjusted = adjuster.adjust(self.id);
        let mut changed = adjusted != self.id;
        self.id = adjusted;
        for delta in &mut self.feature_deltas {
            changed |= delta.adjust_references(adjuster);
        }
        changed
    }
}
