//! Minimal class descriptors.
//!
//! The engine only needs to know, per feature, whether it is a reference,
//! whether it is a containment, whether it is many-valued and unique, and
//! whether it has a persistent opposite. Everything else about the schema
//! lives outside this crate.

use serde::{Deserialize, Serialize};

/// What kind of value a feature holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureKind {
    /// Plain data.
    Attribute,
    /// A reference to other objects.
    Reference {
        /// The referenced objects are contained by the holder.
        containment: bool,
        /// Name of the persistent opposite feature, for bidirectional references.
        opposite: Option<String>,
    },
}

/// Descriptor of one structural feature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureInfo {
    /// Feature name, unique within its class.
    pub name: String,
    /// Attribute or reference.
    pub kind: FeatureKind,
    /// Many-valued (list) feature.
    pub many: bool,
    /// List elements must be distinct.
    pub unique: bool,
}

impl FeatureInfo {
    /// A single-valued attribute.
    pub fn attribute(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FeatureKind::Attribute,
            many: false,
            unique: false,
        }
    }

    /// A many-valued attribute.
    pub fn attribute_list(name: impl Into<String>) -> Self {
        Self {
            many: true,
            ..Self::attribute(name)
        }
    }

    /// A single-valued, non-containment reference.
    pub fn reference(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FeatureKind::Reference {
                containment: false,
                opposite: None,
            },
            many: false,
            unique: false,
        }
    }

    /// A many-valued, unique, non-containment reference.
    pub fn references(name: impl Into<String>) -> Self {
        Self {
            many: true,
            unique: true,
            ..Self::reference(name)
        }
    }

    /// A many-valued, unique containment reference.
    pub fn contents(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FeatureKind::Reference {
                containment: true,
                opposite: None,
            },
            many: true,
            unique: true,
        }
    }

    /// Marks a reference as bidirectional.
    #[must_use]
    pub fn with_opposite(mut self, opposite: impl Into<String>) -> Self {
        if let FeatureKind::Reference { opposite: o, .. } = &mut self.kind {
            *o = Some(opposite.into());
        }
        self
    }

    /// Drops the uniqueness constraint.
    #[must_use]
    pub fn non_unique(mut self) -> Self {
        self.unique = false;
        self
    }

    /// Returns true for references.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(self.kind, FeatureKind::Reference { .. })
    }

    /// Returns true for containment references.
    #[must_use]
    pub fn is_containment(&self) -> bool {
        matches!(
            self.kind,
            FeatureKind::Reference {
                containment: true,
                ..
            }
        )
    }

    /// Returns true for references with a persistent opposite.
    #[must_use]
    pub fn has_opposite(&self) -> bool {
        matches!(
            self.kind,
            FeatureKind::Reference {
                opposite: Some(_),
                ..
            }
        )
    }
}

/// Descriptor of a class: its package and its features.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassInfo {
    /// Package (schema unit) URI or name.
    pub package: String,
    /// Class name.
    pub name: String,
    /// Declared features, in declaration order.
    pub features: Vec<FeatureInfo>,
}

impl ClassInfo {
    /// Creates a class with no features.
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            name: name.into(),
            features: Vec::new(),
        }
    }

    /// Adds a feature.
    #[must_use]
    pub fn with_feature(mut self, feature: FeatureInfo) -> Self {
        self.features.push(feature);
        self
    }

    /// Looks up a feature by name.
    #[must_use]
    pub fn feature(&self, name: &str) -> Option<&FeatureInfo> {
        self.features.iter().find(|f| f.name == name)
    }

    /// Iterates over the reference features.
    pub fn references(&self) -> impl Iterator<Item = &FeatureInfo> {
        self.features.iter().filter(|f| f.is_reference())
    }

    /// Returns `package::name`.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.package, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_predicates() {
        let children = FeatureInfo::contents("children");
        assert!(children.is_reference());
        assert!(children.is_containment());
        assert!(children.many && children.unique);
        assert!(!children.has_opposite());

        let owner = FeatureInfo::reference("owner").with_opposite("owned");
        assert!(owner.has_opposite());
        assert!(!owner.is_containment());

        let tags = FeatureInfo::attribute_list("tags");
        assert!(tags.many && !tags.is_reference());
    }

    #[test]
    fn class_lookup() {
        let class = ClassInfo::new("shop", "Order")
            .with_feature(FeatureInfo::attribute("total"))
            .with_feature(FeatureInfo::references("lines").non_unique());
        assert_eq!(class.qualified_name(), "shop::Order");
        assert!(!class.feature("lines").unwrap().unique);
        assert!(class.feature("missing").is_none());
        assert_eq!(class.references().count(), 1);
    }
}
