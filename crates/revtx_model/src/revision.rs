//! Full object revisions.

use crate::adjust::ReferenceAdjuster;
use crate::branch::BranchPoint;
use crate::class::{ClassInfo, FeatureInfo};
use crate::delta::{list_difference, FeatureDelta, RevisionDelta};
use crate::error::{ModelError, ModelResult};
use crate::id::ObjectId;
use crate::lob::LobRef;
use crate::types::{BranchId, Timestamp, Version};
use crate::value::FeatureValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Snapshot of one object's full state at a branch and version.
///
/// Revisions handed out by the repository are treated as immutable; the
/// transaction edits a private copy and compares it against the clean
/// original to derive deltas.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    id: ObjectId,
    class: Arc<ClassInfo>,
    branch: BranchId,
    version: Version,
    timestamp: Timestamp,
    container: Option<ObjectId>,
    containing_feature: Option<String>,
    resource: Option<ObjectId>,
    values: BTreeMap<String, FeatureValue>,
}

impl Revision {
    /// Creates an uncommitted revision with every list feature empty.
    #[must_use]
    pub fn new(id: ObjectId, class: Arc<ClassInfo>, branch: BranchId) -> Self {
        let values = class
            .features
            .iter()
            .filter(|f| f.many)
            .map(|f| (f.name.clone(), FeatureValue::List(Vec::new())))
            .collect();
        Self {
            id,
            class,
            branch,
            version: Version::UNSPECIFIED,
            timestamp: Timestamp::UNSPECIFIED,
            container: None,
            containing_feature: None,
            resource: None,
            values,
        }
    }

    /// Object identity.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Replaces the identity (temporary to permanent).
    pub fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    /// Class descriptor.
    #[must_use]
    pub fn class(&self) -> &Arc<ClassInfo> {
        &self.class
    }

    /// Branch this revision lives on.
    #[must_use]
    pub fn branch(&self) -> BranchId {
        self.branch
    }

    /// Version on the branch.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Sets the version.
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Commit time of this revision.
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Moves the revision to a new branch point.
    pub fn set_branch_point(&mut self, point: BranchPoint) {
        self.branch = point.branch;
        self.timestamp = point.timestamp;
    }

    /// Containing object, if any.
    #[must_use]
    pub fn container(&self) -> Option<ObjectId> {
        self.container
    }

    /// Feature of the container that holds this object.
    #[must_use]
    pub fn containing_feature(&self) -> Option<&str> {
        self.containing_feature.as_deref()
    }

    /// Resource (root) this object belongs to directly, if any.
    #[must_use]
    pub fn resource(&self) -> Option<ObjectId> {
        self.resource
    }

    /// Returns the container, falling back to the resource.
    #[must_use]
    pub fn container_or_resource(&self) -> Option<ObjectId> {
        self.container.or(self.resource)
    }

    /// Sets the container and the feature that holds this object.
    pub fn set_container(&mut self, container: Option<ObjectId>, feature: Option<String>) {
        self.container = container;
        self.containing_feature = feature;
    }

    /// Sets the direct resource.
    pub fn set_resource(&mut self, resource: Option<ObjectId>) {
        self.resource = resource;
    }

    /// Looks up a feature descriptor.
    pub fn feature_info(&self, feature: &str) -> ModelResult<&FeatureInfo> {
        self.class
            .feature(feature)
            .ok_or_else(|| ModelError::UnknownFeature {
                class: self.class.qualified_name(),
                feature: feature.to_owned(),
            })
    }

    /// Returns the stored value of a feature.
    #[must_use]
    pub fn get(&self, feature: &str) -> Option<&FeatureValue> {
        self.values.get(feature)
    }

    /// Sets a feature value, returning the previous one.
    pub fn set(&mut self, feature: &str, value: FeatureValue) -> ModelResult<Option<FeatureValue>> {
        self.feature_info(feature)?;
        Ok(self.values.insert(feature.to_owned(), value))
    }

    /// Unsets a feature; list features become empty.
    pub fn unset(&mut self, feature: &str) -> ModelResult<Option<FeatureValue>> {
        let many = self.feature_info(feature)?.many;
        if many {
            Ok(self
                .values
                .insert(feature.to_owned(), FeatureValue::List(Vec::new())))
        } else {
            Ok(self.values.remove(feature))
        }
    }

    /// Returns the elements of a list feature.
    pub fn list(&self, feature: &str) -> ModelResult<&[FeatureValue]> {
        if !self.feature_info(feature)?.many {
            return Err(ModelError::NotAList {
                feature: feature.to_owned(),
            });
        }
        Ok(self
            .values
            .get(feature)
            .and_then(FeatureValue::as_list)
            .unwrap_or(&[]))
    }

    /// Returns mutable access to a list feature.
    pub fn list_mut(&mut self, feature: &str) -> ModelResult<&mut Vec<FeatureValue>> {
        if !self.feature_info(feature)?.many {
            return Err(ModelError::NotAList {
                feature: feature.to_owned(),
            });
        }
        let slot = self
            .values
            .entry(feature.to_owned())
            .or_insert_with(|| FeatureValue::List(Vec::new()));
        if !matches!(slot, FeatureValue::List(_)) {
            *slot = FeatureValue::List(Vec::new());
        }
        match slot {
            FeatureValue::List(items) => Ok(items),
            _ => Err(ModelError::NotAList {
                feature: feature.to_owned(),
            }),
        }
    }

    /// Returns the number of elements in a list feature.
    pub fn size(&self, feature: &str) -> ModelResult<usize> {
        self.list(feature).map(<[FeatureValue]>::len)
    }

    /// Iterates over the stored feature values.
    pub fn values(&self) -> impl Iterator<Item = (&str, &FeatureValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Calls `f` with `(feature, id)` for every reference in feature values.
    ///
    /// Container and resource links are not included.
    pub fn for_each_reference(&self, mut f: impl FnMut(&str, ObjectId)) {
        for (feature, value) in &self.values {
            value.for_each_id(&mut |id| f(feature, id));
        }
    }

    /// Collects the lobs referenced by this revision.
    #[must_use]
    pub fn lobs(&self) -> Vec<LobRef> {
        let mut lobs = Vec::new();
        for value in self.values.values() {
            value.for_each_lob(&mut |lob| lobs.push(*lob));
        }
        lobs
    }

    /// Rewrites container, resource and feature references.
    ///
    /// The revision's own ID is left alone. Returns true if anything changed.
    pub fn adjust_references(&mut self, adjuster: &dyn ReferenceAdjuster) -> bool {
        let mut changed = false;
        for link in [&mut self.container, &mut self.resource] {
            if let Some(id) = link {
                let adjusted = adjuster.adjust(*id);
                changed |= adjusted != *id;
                *id = adjusted;
            }
        }
        for value in self.values.values_mut() {
            changed |= value.adjust_references(adjuster);
        }
        changed
    }

    /// Removes every feature reference for which `dangling` returns true.
    ///
    /// List elements are dropped; single-valued references are unset.
    /// Returns true if anything was removed.
    pub fn remove_references(&mut self, dangling: impl Fn(ObjectId) -> bool) -> bool {
        let mut changed = false;
        let mut unset = Vec::new();
        for (feature, value) in self.values.iter_mut() {
            match value {
                FeatureValue::Ref(id) if dangling(*id) => unset.push(feature.clone()),
                FeatureValue::List(items) => {
                    let before = items.len();
                    items.retain(|item| !item.as_id().is_some_and(|id| dangling(id)));
                    changed |= items.len() != before;
                }
                _ => {}
            }
        }
        for feature in unset {
            self.values.remove(&feature);
            changed = true;
        }
        changed
    }

    /// Computes the delta that turns `clean` into `self`.
    #[must_use]
    pub fn compare(&self, clean: &Revision) -> RevisionDelta {
        let mut delta = RevisionDelta::new(clean.id, clean.branch, clean.version);
        if self.container != clean.container
            || self.containing_feature != clean.containing_feature
            || self.resource != clean.resource
        {
            delta.add_feature_delta(FeatureDelta::Container {
                container: self.container,
                containing_feature: self.containing_feature.clone(),
                resource: self.resource,
            });
        }
        for feature in &self.class.features {
            let name = feature.name.as_str();
            let old = clean.values.get(name);
            let new = self.values.get(name);
            if old == new {
                continue;
            }
            if feature.many {
                let empty = Vec::new();
                let old = old.and_then(FeatureValue::as_list).unwrap_or(&empty);
                let new = new.and_then(FeatureValue::as_list).unwrap_or(&empty);
                let changes = list_difference(name, old, new);
                if !changes.is_empty() {
                    delta.add_feature_delta(FeatureDelta::List {
                        feature: name.to_owned(),
                        changes,
                    });
                }
            } else {
                match new {
                    Some(value) => delta.add_feature_delta(FeatureDelta::Set {
                        feature: name.to_owned(),
                        value: value.clone(),
                        old_value: old.cloned(),
                    }),
                    None => delta.add_feature_delta(FeatureDelta::Unset {
                        feature: name.to_owned(),
                    }),
                }
            }
        }
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjust::IdMapper;

    fn node_class() -> Arc<ClassInfo> {
        Arc::new(
            ClassInfo::new("test", "Node")
                .with_feature(FeatureInfo::attribute("name"))
                .with_feature(FeatureInfo::reference("parent"))
                .with_feature(FeatureInfo::contents("children")),
        )
    }

    fn node(id: u64) -> Revision {
        Revision::new(ObjectId::permanent(id), node_class(), BranchId::MAIN)
    }

    #[test]
    fn new_revision_has_empty_lists() {
        let rev = node(1);
        assert_eq!(rev.size("children").unwrap(), 0);
        assert!(rev.get("name").is_none());
        assert_eq!(rev.version(), Version::UNSPECIFIED);
    }

    #[test]
    fn set_rejects_unknown_feature() {
        let mut rev = node(1);
        let err = rev.set("bogus", FeatureValue::Int(1)).unwrap_err();
        assert!(matches!(err, ModelError::UnknownFeature { .. }));
    }

    #[test]
    fn list_access_requires_many_feature() {
        let mut rev = node(1);
        assert!(matches!(
            rev.list_mut("name"),
            Err(ModelError::NotAList { .. })
        ));
    }

    #[test]
    fn compare_detects_changes() {
        let clean = node(1);
        let mut dirty = clean.clone();
        dirty.set("name", "root".into()).unwrap();
        dirty
            .list_mut("children")
            .unwrap()
            .push(FeatureValue::Ref(ObjectId::permanent(2)));
        dirty.set_container(Some(ObjectId::permanent(9)), Some("children".into()));

        let delta = dirty.compare(&clean);
        assert_eq!(delta.id(), ObjectId::permanent(1));
        assert_eq!(delta.feature_deltas().len(), 3);

        let mut replay = clean.clone();
        delta.apply(&mut replay).unwrap();
        assert_eq!(replay, dirty);
    }

    #[test]
    fn compare_identical_is_empty() {
        let rev = node(1);
        assert!(rev.compare(&rev.clone()).is_empty());
    }

    #[test]
    fn adjust_references_rewrites_links() {
        let mut rev = node(1);
        rev.set_container(Some(ObjectId::temp(1)), Some("children".into()));
        rev.set("parent", FeatureValue::Ref(ObjectId::temp(2)))
            .unwrap();

        let mut mapper = IdMapper::new();
        mapper.insert(ObjectId::temp(1), ObjectId::permanent(10));
        mapper.insert(ObjectId::temp(2), ObjectId::permanent(20));

        assert!(rev.adjust_references(&mapper));
        assert_eq!(rev.container(), Some(ObjectId::permanent(10)));
        assert_eq!(
            rev.get("parent"),
            Some(&FeatureValue::Ref(ObjectId::permanent(20)))
        );
    }

    #[test]
    fn remove_references_prunes_lists_and_singles() {
        let mut rev = node(1);
        rev.set("parent", FeatureValue::Ref(ObjectId::permanent(5)))
            .unwrap();
        rev.list_mut("children").unwrap().extend([
            FeatureValue::Ref(ObjectId::permanent(5)),
            FeatureValue::Ref(ObjectId::permanent(6)),
        ]);

        assert!(rev.remove_references(|id| id == ObjectId::permanent(5)));
        assert!(rev.get("parent").is_none());
        assert_eq!(
            rev.list("children").unwrap(),
            &[FeatureValue::Ref(ObjectId::permanent(6))]
        );
        assert!(!rev.remove_references(|id| id == ObjectId::permanent(5)));
    }
}
