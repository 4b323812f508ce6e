//! # revtx Testkit
//!
//! Test utilities for revtx.
//!
//! This crate provides:
//! - An in-memory repository that implements the session protocol
//! - A fault-injecting session wrapper for failure paths
//! - Property-based test generators using proptest
//! - Fixtures: a small schema, seeded repositories and scratch files
//!
//! ## Usage
//!
//! ```rust,ignore
//! use revtx_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_repository() {
//!     let fixture = TestRepository::with_items(2);
//!     let tx = Transaction::new(fixture.session.clone());
//!     // ... edit and commit
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faults;
pub mod fixtures;
pub mod generators;
pub mod repository;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::repository::*;
}

pub use faults::*;
pub use fixtures::*;
pub use generators::*;
pub use repository::*;
