//! Core type definitions for the transaction engine.

use std::fmt;

/// Identifier of a transaction, also used as its view ID on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u32);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Identifier of a savepoint within its chain.
///
/// Savepoint IDs are never reused, so a handle to a discarded savepoint can
/// be told apart from the savepoint that later takes its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SavepointId(pub u64);

impl SavepointId {
    /// Creates a new savepoint ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SavepointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sp:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        assert_eq!(TransactionId::new(4).to_string(), "txn:4");
        assert_eq!(SavepointId::new(9).to_string(), "sp:9");
    }

    #[test]
    fn ordering_follows_raw_value() {
        assert!(SavepointId::new(1) < SavepointId::new(2));
        assert_eq!(TransactionId::new(7).as_u32(), 7);
    }
}
