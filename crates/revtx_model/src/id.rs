//! Object identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identity of an object in the repository.
///
/// Objects created locally carry a temporary ID until the repository assigns
/// a permanent one during commit. Permanent IDs are stable across branches
/// and time; temporary IDs are only meaningful inside the transaction that
/// minted them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectId {
    /// Client-minted identity of an uncommitted object.
    Temp(u32),
    /// Repository-assigned identity.
    Permanent(u64),
}

impl ObjectId {
    /// Creates a temporary ID.
    #[inline]
    #[must_use]
    pub const fn temp(value: u32) -> Self {
        Self::Temp(value)
    }

    /// Creates a permanent ID.
    #[inline]
    #[must_use]
    pub const fn permanent(value: u64) -> Self {
        Self::Permanent(value)
    }

    /// Returns true for client-minted IDs.
    #[inline]
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temp(_))
    }

    /// Returns the temporary counter value, if this is a temporary ID.
    #[inline]
    #[must_use]
    pub const fn temp_value(&self) -> Option<u32> {
        match self {
            Self::Temp(v) => Some(*v),
            Self::Permanent(_) => None,
        }
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temp(v) => write!(f, "#t{v}"),
            Self::Permanent(v) => write!(f, "#{v}"),
        }
    }
}

/// Mints temporary object IDs for one transaction.
///
/// The generator never hands out the same value twice until it is reset after
/// a full commit. Change sets imported from elsewhere may carry temporary IDs
/// of their own; [`fast_forward`](Self::fast_forward) moves the counter past
/// them so new objects never collide.
///
/// A floor keeps the IDs of one generator above a fixed value, across
/// resets. Transactions that commit together use it to mint disjoint IDs.
#[derive(Debug, Default, Clone)]
pub struct TempIdGenerator {
    last: u32,
    floor: u32,
}

impl TempIdGenerator {
    /// Creates a generator whose first ID is `#t1`.
    #[must_use]
    pub const fn new() -> Self {
        Self { last: 0, floor: 0 }
    }

    /// Sets the value every reset returns to and moves the counter past it.
    pub fn set_floor(&mut self, floor: u32) {
        self.floor = floor;
        self.fast_forward(floor);
    }

    /// Value the counter restarts from on [`reset`](Self::reset).
    #[must_use]
    pub const fn floor(&self) -> u32 {
        self.floor
    }

    /// Returns the next temporary ID.
    pub fn next_id(&mut self) -> ObjectId {
        self.last += 1;
        ObjectId::Temp(self.last)
    }

    /// Ensures the next ID is greater than `seen`.
    pub fn fast_forward(&mut self, seen: u32) {
        if seen > self.last {
            self.last = seen;
        }
    }

    /// Skips `count` IDs so a batch of imported objects can be renumbered
    /// without interleaving with locally created ones.
    pub fn reserve(&mut self, count: u32) {
        self.last += count;
    }

    /// Returns the last value handed out.
    #[must_use]
    pub const fn last(&self) -> u32 {
        self.last
    }

    /// Resets the counter to the floor after all temporary IDs have been
    /// replaced.
    pub fn reset(&mut self) {
        self.last = self.floor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_sequential() {
        let mut ids = TempIdGenerator::new();
        assert_eq!(ids.next_id(), ObjectId::temp(1));
        assert_eq!(ids.next_id(), ObjectId::temp(2));
        assert_eq!(ids.last(), 2);
    }

    #[test]
    fn fast_forward_only_moves_forward() {
        let mut ids = TempIdGenerator::new();
        ids.fast_forward(10);
        assert_eq!(ids.next_id(), ObjectId::temp(11));
        ids.fast_forward(3);
        assert_eq!(ids.next_id(), ObjectId::temp(12));
    }

    #[test]
    fn reserve_and_reset() {
        let mut ids = TempIdGenerator::new();
        ids.reserve(5);
        assert_eq!(ids.next_id(), ObjectId::temp(6));
        ids.reset();
        assert_eq!(ids.next_id(), ObjectId::temp(1));
    }

    #[test]
    fn reset_returns_to_floor() {
        let mut ids = TempIdGenerator::new();
        ids.next_id();
        ids.set_floor(100);
        assert_eq!(ids.next_id(), ObjectId::temp(101));
        ids.reset();
        assert_eq!(ids.next_id(), ObjectId::temp(101));
        ids.set_floor(0);
        ids.reset();
        assert_eq!(ids.next_id(), ObjectId::temp(1));
    }

    #[test]
    fn temporary_vs_permanent() {
        assert!(ObjectId::temp(1).is_temporary());
        assert!(!ObjectId::permanent(1).is_temporary());
        assert_eq!(ObjectId::temp(7).temp_value(), Some(7));
        assert_eq!(ObjectId::permanent(7).temp_value(), None);
        assert_eq!(ObjectId::temp(1).to_string(), "#t1");
        assert_eq!(ObjectId::permanent(77).to_string(), "#77");
    }
}
