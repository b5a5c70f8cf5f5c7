//! Core chain types: hashes, header state, flags, the chain cursor.
//!
//! A header's content hash is SHA-256 over the canonical little-endian
//! field encoding. The history MMR hashes with BLAKE3 (see [`crate::mmr`]).

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A 32-byte hash value.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash. A genesis header carries it as its parent hash.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Identifier of the peer a block body was downloaded from.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// The all-zero peer id, used when no origin is recorded.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Flag bits stored in a header row's `Flags` column.
///
/// Unused bits are reserved and preserved by every update.
pub mod state_flags {
    /// The block body has been validated and is available locally.
    pub const FUNCTIONAL: u32 = 0x1;
    /// Every ancestor up to genesis is functional.
    pub const REACHABLE: u32 = 0x2;
    /// The header lies on the currently selected chain.
    pub const ACTIVE: u32 = 0x4;
}

/// The persisted portion of a block header, opaque to the store apart
/// from `height` and `prev` which drive the ancestry graph.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct StateHeader {
    /// Block height. Genesis is 0.
    pub height: u64,
    /// Content hash of the parent header; [`Hash256::ZERO`] at genesis.
    pub prev: Hash256,
    /// Work target, uninterpreted here.
    pub difficulty: u64,
    /// Unix timestamp, uninterpreted here.
    pub timestamp: u64,
    /// Commitment to the live-object set after this block.
    pub live_objects: Hash256,
    /// Commitment to the header history before this block.
    pub history: Hash256,
}

impl StateHeader {
    /// Content hash: SHA-256 over the canonical field encoding.
    pub fn hash(&self) -> Hash256 {
        let mut hasher = Sha256::new();
        hasher.update(self.height.to_le_bytes());
        hasher.update(self.prev.as_bytes());
        hasher.update(self.difficulty.to_le_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.live_objects.as_bytes());
        hasher.update(self.history.as_bytes());
        Hash256(hasher.finalize().into())
    }
}

/// Identifies a persisted header: its height and its store row.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct StateId {
    /// Block height.
    pub height: u64,
    /// Store row id. Row ids start at 1; 0 means "no state".
    pub row: u64,
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.row, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(height: u64, prev: Hash256) -> StateHeader {
        StateHeader {
            height,
            prev,
            difficulty: 100,
            timestamp: 1_000_000 + height * 60,
            live_objects: Hash256([0x11; 32]),
            history: Hash256([0x22; 32]),
        }
    }

    #[test]
    fn hash_deterministic() {
        let h = header(3, Hash256([0xAA; 32]));
        assert_eq!(h.hash(), h.hash());
    }

    #[test]
    fn hash_covers_every_field() {
        let base = header(3, Hash256([0xAA; 32]));
        let mut variants = vec![base];
        variants.push(StateHeader { height: 4, ..base });
        variants.push(StateHeader { prev: Hash256([0xAB; 32]), ..base });
        variants.push(StateHeader { difficulty: 101, ..base });
        variants.push(StateHeader { timestamp: base.timestamp + 1, ..base });
        variants.push(StateHeader { live_objects: Hash256([0x33; 32]), ..base });
        variants.push(StateHeader { history: Hash256([0x44; 32]), ..base });

        let hashes: Vec<Hash256> = variants.iter().map(StateHeader::hash).collect();
        for (i, a) in hashes.iter().enumerate() {
            for (j, b) in hashes.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b, "fields {i} and {j} collide");
                }
            }
        }
    }

    #[test]
    fn hash_display_is_hex() {
        assert_eq!(
            Hash256::ZERO.to_string(),
            "0000000000000000000000000000000000000000000000000000000000000000"
        );
    }

    #[test]
    fn zero_hash_detection() {
        assert!(Hash256::ZERO.is_zero());
        assert!(!Hash256([1; 32]).is_zero());
    }
}
