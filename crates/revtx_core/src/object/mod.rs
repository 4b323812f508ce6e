//! Managed objects and their lifecycle.
//!
//! Every object a transaction touches lives in an arena keyed by
//! [`ObjectId`](revtx_model::ObjectId). State changes go through a
//! single transition table ([`ObjectState::transition`]) so illegal
//! combinations are rejected in one place.

mod registry;
mod state;

pub use registry::ManagedObject;
pub use state::{ObjectEvent, ObjectState, Transition};

pub(crate) use registry::{ContainerLinks, ObjectRegistry};
