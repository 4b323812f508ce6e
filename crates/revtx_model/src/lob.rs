//! Large objects (blobs and clobs).
//!
//! Lob payloads are content-addressed: the ID is the SHA-256 digest of the
//! bytes, so the client can ask the repository which payloads it already
//! holds and skip re-sending them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Content hash identifying a lob payload.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LobId(pub [u8; 32]);

impl LobId {
    /// Computes the ID of `data`.
    #[must_use]
    pub fn from_content(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Returns the raw digest.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for LobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LobId({self})")
    }
}

impl fmt::Display for LobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Binary or character lob.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum LobKind {
    /// Binary payload.
    Blob,
    /// UTF-8 text payload.
    Clob,
}

/// The value a feature stores for a lob: identity and size, not content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct LobRef {
    /// Content hash.
    pub id: LobId,
    /// Payload length in bytes.
    pub size: u64,
    /// Blob or clob.
    pub kind: LobKind,
}

/// A lob with its payload, as collected for a commit.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Lob {
    /// Reference stored in the owning feature.
    pub reference: LobRef,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl Lob {
    /// Creates a blob.
    #[must_use]
    pub fn blob(data: Vec<u8>) -> Self {
        Self::with_kind(data, LobKind::Blob)
    }

    /// Creates a clob.
    pub fn clob(text: impl Into<String>) -> Self {
        Self::with_kind(text.into().into_bytes(), LobKind::Clob)
    }

    fn with_kind(data: Vec<u8>, kind: LobKind) -> Self {
        Self {
            reference: LobRef {
                id: LobId::from_content(&data),
                size: data.len() as u64,
                kind,
            },
            data,
        }
    }

    /// Returns the content hash.
    #[must_use]
    pub fn id(&self) -> LobId {
        self.reference.id
    }
}
