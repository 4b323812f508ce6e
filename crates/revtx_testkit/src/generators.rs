//! Property-based test generators using proptest.
//!
//! Edits are generated as plain data ([`Edit`]) so any transaction
//! implementation can interpret them. Object positions are indices into
//! whatever objects the interpreter currently knows; interpreters take them
//! modulo the number of candidates.

use proptest::prelude::*;
use revtx_model::{FeatureValue, ObjectId};

/// One step of a generated editing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    /// Create a new object.
    Create,
    /// Set the `name` attribute of an object.
    Rename {
        /// Object position.
        target: usize,
        /// New name.
        name: String,
    },
    /// Set the `size` attribute of an object.
    Resize {
        /// Object position.
        target: usize,
        /// New size.
        size: i64,
    },
    /// Append a reference from one object to another.
    Link {
        /// Referencing object position.
        source: usize,
        /// Referenced object position.
        target: usize,
    },
    /// Detach an object.
    Detach {
        /// Object position.
        target: usize,
    },
    /// Reattach a previously detached object.
    Reattach {
        /// Position among detached objects.
        target: usize,
    },
    /// Start a new savepoint.
    Savepoint,
}

/// Strategy for temporary object IDs.
pub fn temp_id_strategy() -> impl Strategy<Value = ObjectId> {
    (1u32..10_000).prop_map(ObjectId::temp)
}

/// Strategy for permanent object IDs.
pub fn permanent_id_strategy() -> impl Strategy<Value = ObjectId> {
    (1u64..1_000_000).prop_map(ObjectId::permanent)
}

/// Strategy for object IDs of either kind.
pub fn object_id_strategy() -> impl Strategy<Value = ObjectId> {
    prop_oneof![temp_id_strategy(), permanent_id_strategy()]
}

/// Strategy for object names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9]{0,11}").expect("Invalid regex")
}

/// Strategy for scalar feature values.
pub fn scalar_value_strategy() -> impl Strategy<Value = FeatureValue> {
    prop_oneof![
        any::<bool>().prop_map(FeatureValue::Bool),
        any::<i64>().prop_map(FeatureValue::Int),
        name_strategy().prop_map(FeatureValue::Text),
        prop::collection::vec(any::<u8>(), 0..32).prop_map(FeatureValue::Bytes),
    ]
}

/// Strategy for one edit.
pub fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        3 => Just(Edit::Create),
        3 => (any::<usize>(), name_strategy()).prop_map(|(target, name)| Edit::Rename { target, name }),
        2 => (any::<usize>(), -1000i64..1000).prop_map(|(target, size)| Edit::Resize { target, size }),
        2 => (any::<usize>(), any::<usize>()).prop_map(|(source, target)| Edit::Link { source, target }),
        1 => any::<usize>().prop_map(|target| Edit::Detach { target }),
        1 => any::<usize>().prop_map(|target| Edit::Reattach { target }),
        1 => Just(Edit::Savepoint),
    ]
}

/// Strategy for an editing session of up to `max` steps.
pub fn edits_strategy(max: usize) -> impl Strategy<Value = Vec<Edit>> {
    prop::collection::vec(edit_strategy(), 0..max)
}
