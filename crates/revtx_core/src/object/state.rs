//! Object lifecycle states and the transition table.

/// Lifecycle state of an object managed by a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectState {
    /// Not attached to any transaction.
    Transient,
    /// Created in this transaction and not yet committed.
    New,
    /// Loaded from the repository and unmodified.
    Clean,
    /// Loaded from the repository and modified.
    Dirty,
    /// Removed from the object graph; terminal unless reattached.
    Detached,
}

impl ObjectState {
    /// Returns true for states in which the object can be looked up.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::New | Self::Clean | Self::Dirty)
    }

    /// Looks up the transition for `event` in this state.
    ///
    /// Returns `None` when the pair is illegal.
    #[must_use]
    pub const fn transition(self, event: ObjectEvent) -> Option<Transition> {
        use ObjectEvent as E;
        use ObjectState as S;
        use Transition as T;

        let transition = match (self, event) {
            (S::Transient, E::Attach) => T::Enter(S::New),
            (S::Transient, E::Write | E::Detach | E::Invalidate | E::DetachRemote) => T::Ignore,

            (S::New, E::Write) => T::Ignore,
            (S::New, E::Detach) => T::Enter(S::Detached),
            (S::New, E::Commit) => T::Enter(S::Clean),

            (S::Clean, E::Attach | E::Rollback) => T::Ignore,
            (S::Clean, E::Write) => T::Enter(S::Dirty),
            (S::Clean, E::Detach | E::DetachRemote) => T::Enter(S::Detached),
            (S::Clean, E::Invalidate) => T::Ignore,

            (S::Dirty, E::Attach | E::Write) => T::Ignore,
            (S::Dirty, E::Detach) => T::Enter(S::Detached),
            (S::Dirty, E::Commit | E::Rollback) => T::Enter(S::Clean),
            (S::Dirty, E::Invalidate | E::DetachRemote) => T::Conflict,

            (S::Detached, E::Reattach) => T::Restore,
            (S::Detached, E::Commit) => T::Enter(S::Transient),
            (S::Detached, E::Detach | E::Invalidate | E::DetachRemote) => T::Ignore,

            _ => return None,
        };
        Some(transition)
    }
}

/// Something that happens to a managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectEvent {
    /// The object joins the transaction as a new object.
    Attach,
    /// A feature of the object is modified.
    Write,
    /// The object is removed from the graph.
    Detach,
    /// A detached object is brought back.
    Reattach,
    /// The transaction committed successfully.
    Commit,
    /// The transaction rolled the object back.
    Rollback,
    /// Another view committed a change to the object.
    Invalidate,
    /// Another view detached the object.
    DetachRemote,
}

/// Outcome of a legal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Keep the current state.
    Ignore,
    /// Move to the given state.
    Enter(ObjectState),
    /// Return to the state the object had before it was detached.
    Restore,
    /// Keep the state and raise the conflict flag.
    Conflict,
}
