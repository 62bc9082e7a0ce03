//! Hash newtypes and digest helpers.
//!
//! `Hash32` is used for transaction ids and block hashes and displays in the
//! conventional reversed-hex form. `Hash20` is a HASH160 output used for
//! public-key and script hashes.

use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Double SHA-256 of `data`.
#[must_use]
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// RIPEMD-160 of SHA-256 of `data`.
#[must_use]
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(sha);
    ripe.into()
}

/// A 32-byte hash, typically a transaction id.
///
/// Equality and ordering are byte-wise. Display reverses the bytes, which is
/// the form block explorers and node RPCs use for tx ids.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    /// The all-zero hash, used as a "not set" marker in several protocol
    /// fields.
    pub const ZERO: Hash32 = Hash32([0u8; 32]);

    /// Builds a hash by double-SHA-256 of `data`.
    #[must_use]
    pub fn hash(data: &[u8]) -> Self {
        Hash32(double_sha256(data))
    }

    /// Returns true if every byte is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// The raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parses from a 32-byte slice.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Hash32(arr))
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        write!(f, "{}", hex::encode(reversed))
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({self})")
    }
}

impl From<[u8; 32]> for Hash32 {
    fn from(bytes: [u8; 32]) -> Self {
        Hash32(bytes)
    }
}

/// A 20-byte hash, the output of HASH160.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Hash20(pub [u8; 20]);

impl Hash20 {
    /// Builds a hash by HASH160 of `data`.
    #[must_use]
    pub fn hash(data: &[u8]) -> Self {
        Hash20(hash160(data))
    }

    /// The raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Parses from a 20-byte slice.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(Hash20(arr))
    }
}

impl std::fmt::Display for Hash20 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Hash20 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash20({self})")
    }
}

impl From<[u8; 20]> for Hash20 {
    fn from(bytes: [u8; 20]) -> Self {
        Hash20(bytes)
    }
}
