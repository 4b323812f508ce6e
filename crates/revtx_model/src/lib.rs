//! # revtx Model
//!
//! Identity and versioning model shared by every revtx crate.
//!
//! This crate provides:
//! - Object identities that start out temporary and become permanent at commit
//! - Branch points and the branch tree
//! - Full revisions and the feature-level deltas between them
//! - Change-set aggregates, lock states and large-object references
//! - CBOR serialization helpers for everything above
//!
//! ## Identity
//!
//! An object created on the client is given an [`ObjectId::Temp`] minted by a
//! [`TempIdGenerator`]. The repository replaces it with an
//! [`ObjectId::Permanent`] when the object is committed; the mapping is
//! carried back as an [`IdMapper`] that implements [`ReferenceAdjuster`].
//!
//! ## Usage
//!
//! ```
//! use revtx_model::{ClassInfo, FeatureInfo, FeatureValue, Revision, TempIdGenerator, BranchId};
//! use std::sync::Arc;
//!
//! let class = Arc::new(ClassInfo::new("shop", "Order").with_feature(FeatureInfo::attribute("total")));
//! let mut ids = TempIdGenerator::new();
//! let mut revision = Revision::new(ids.next_id(), class, BranchId::MAIN);
//! revision.set("total", FeatureValue::Int(42)).unwrap();
//! assert_eq!(revision.get("total"), Some(&FeatureValue::Int(42)));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adjust;
mod branch;
mod cbor;
mod change_set;
mod class;
mod delta;
mod error;
mod id;
mod lob;
mod lock;
mod revision;
mod types;
mod value;

pub use adjust::{IdMapper, ReferenceAdjuster};
pub use branch::{Branch, BranchPoint, BranchRegistry};
pub use cbor::{from_cbor, to_cbor};
pub use change_set::{ChangeSetData, IdAndVersion, RevisionProvider};
pub use class::{ClassInfo, FeatureInfo, FeatureKind};
pub use delta::{list_difference, FeatureDelta, RevisionDelta, CONTAINER_FEATURE};
pub use error::{ModelError, ModelResult};
pub use id::{ObjectId, TempIdGenerator};
pub use lob::{Lob, LobId, LobKind, LobRef};
pub use lock::{LockOwner, LockState, LockTarget, LockType};
pub use revision::Revision;
pub use types::{BranchId, Timestamp, Version};
pub use value::FeatureValue;
