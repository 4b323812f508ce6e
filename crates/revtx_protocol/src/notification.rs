//! Push notifications from the repository.

use crate::messages::CommitInfo;
use parking_lot::RwLock;
use revtx_model::{Branch, LockOwner, LockState, LockType, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lock or unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockOperation {
    /// Locks were acquired.
    Lock,
    /// Locks were released.
    Unlock,
}

/// Lock ownership changed somewhere in the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockChangeInfo {
    /// Time of the change.
    pub timestamp: Timestamp,
    /// Owner that locked or unlocked.
    pub owner: LockOwner,
    /// Lock or unlock.
    pub operation: LockOperation,
    /// Lock type involved.
    pub lock_type: LockType,
    /// Resulting lock states.
    pub lock_states: Vec<LockState>,
}

/// Activity of other sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteSessionEvent {
    /// A session was opened.
    Opened {
        /// Session number.
        session_id: u32,
        /// User of that session.
        user_id: String,
    },
    /// A session was closed.
    Closed {
        /// Session number.
        session_id: u32,
    },
    /// A session sent a message.
    Message {
        /// Sender.
        session_id: u32,
        /// Message topic.
        topic: String,
        /// Payload.
        body: Vec<u8>,
    },
}

/// A notification pushed by the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionNotification {
    /// Another view committed.
    Commit(CommitInfo),
    /// A branch was created.
    BranchCreated(Branch),
    /// Lock ownership changed.
    LockChanged(LockChangeInfo),
    /// Another session did something.
    RemoteSession(RemoteSessionEvent),
}

/// Receives session notifications.
///
/// Listeners run on the delivering thread and must not block on the
/// session that delivers to them.
pub trait SessionListener: Send + Sync {
    /// Handles one notification.
    fn notify(&self, notification: &SessionNotification);
}

impl<F> SessionListener for F
where
    F: Fn(&SessionNotification) + Send + Sync,
{
    fn notify(&self, notification: &SessionNotification) {
        self(notification);
    }
}

/// Handle returned by [`NotificationHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Fans notifications out to subscribed listeners.
#[derive(Default)]
pub struct NotificationHub {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn SessionListener>)>>,
    next_id: AtomicU64,
}

impl NotificationHub {
    /// Creates a hub without listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a listener.
    pub fn subscribe(&self, listener: Arc<dyn SessionListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners.write().push((id, listener));
        id
    }

    /// Removes a listener; returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }

    /// Delivers a notification to every listener.
    ///
    /// The listener list is snapshotted first, so listeners may subscribe or
    /// unsubscribe while being notified.
    pub fn publish(&self, notification: &SessionNotification) {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        tracing::trace!(listeners = listeners.len(), "publishing session notification");
        for listener in listeners {
            listener.notify(notification);
        }
    }

    /// Returns the number of subscribed listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl std::fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHub")
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}
