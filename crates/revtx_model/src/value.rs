//! Feature values.

use crate::adjust::ReferenceAdjuster;
use crate::id::ObjectId;
use crate::lob::LobRef;
use serde::{Deserialize, Serialize};

/// The value stored in one feature of a revision.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureValue {
    /// No value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Reference to another object.
    Ref(ObjectId),
    /// Large object stored out of line.
    Lob(LobRef),
    /// Many-valued feature contents.
    List(Vec<FeatureValue>),
}

impl FeatureValue {
    /// Returns the referenced ID for [`FeatureValue::Ref`].
    #[must_use]
    pub fn as_id(&self) -> Option<ObjectId> {
        match self {
            Self::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// Returns the elements of a list value.
    #[must_use]
    pub fn as_list(&self) -> Option<&[FeatureValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns true for [`FeatureValue::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Calls `f` for every object ID this value references, recursing into lists.
    pub fn for_each_id(&self, f: &mut impl FnMut(ObjectId)) {
        match self {
            Self::Ref(id) => f(*id),
            Self::List(items) => items.iter().for_each(|item| item.for_each_id(f)),
            _ => {}
        }
    }

    /// Calls `f` for every lob this value references.
    pub fn for_each_lob(&self, f: &mut impl FnMut(&LobRef)) {
        match self {
            Self::Lob(lob) => f(lob),
            Self::List(items) => items.iter().for_each(|item| item.for_each_lob(f)),
            _ => {}
        }
    }

    /// Rewrites references through `adjuster`; returns true if anything changed.
    pub fn adjust_references(&mut self, adjuster: &dyn ReferenceAdjuster) -> bool {
        match self {
            Self::Ref(id) => {
                let adjusted = adjuster.adjust(*id);
                let changed = adjusted != *id;
                *id = adjusted;
                changed
            }
            Self::List(items) => items
                .iter_mut()
                .fold(false, |changed, item| item.adjust_references(adjuster) | changed),
            _ => false,
        }
    }
}

impl From<bool> for FeatureValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for FeatureValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for FeatureValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<ObjectId> for FeatureValue {
    fn from(v: ObjectId) -> Self {
        Self::Ref(v)
    }
}
