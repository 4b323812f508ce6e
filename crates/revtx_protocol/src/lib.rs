//! # revtx Protocol
//!
//! Call/response contracts between a client transaction engine and a
//! versioned object repository.
//!
//! This crate provides:
//! - Request and result types for commits, XA phases, locking and loading
//! - The [`SessionProtocol`] trait every repository connection implements
//! - Push notifications and the [`NotificationHub`] that fans them out
//! - A [`MockSession`] for unit tests
//!
//! Byte-level framing is left to implementations; all types derive serde so
//! any encoding can be plugged in.
//!
//! ## Commit outcome
//!
//! A commit that the repository rejects is *not* an error at this layer: it
//! comes back as a [`CommitTransactionResult`] carrying a rollback message.
//! Errors are reserved for transport problems ([`ProtocolError`]).

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod messages;
mod notification;
mod session;

pub use config::{RetryConfig, SessionConfig};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    CommitData, CommitDelegationRequest, CommitInfo, CommitRequest, CommitTransactionResult,
    FetchRule, LoadRevisionsRequest, LockObjectsRequest, LockObjectsResult, ObjectReference,
    OpenSessionRequest, OpenSessionResult, PackageState, PackageUnit, UnlockObjectsRequest,
    UnlockObjectsResult, XaPhase2Request,
};
pub use notification::{
    ListenerId, LockChangeInfo, LockOperation, NotificationHub, RemoteSessionEvent,
    SessionListener, SessionNotification,
};
pub use session::{with_retry, MockSession, SessionProtocol};
