//! 32-byte identity identifier derived from SHA-256(public key).

use secp256k1::XOnlyPublicKey;
use std::fmt;

use super::{sha256, IdentityError};

/// Identifier of a network identity: the SHA-256 hash of its public key.
///
/// Used as the key of the registry's identity indices, so two sessions that
/// proved the same public key always map to the same identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdentityId([u8; 32]);

impl IdentityId {
    /// Create an IdentityId from a 32-byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create an IdentityId from a slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self, IdentityError> {
        let bytes: [u8; 32] = slice
            .try_into()
            .map_err(|_| IdentityError::InvalidIdentityIdLength(slice.len()))?;
        Ok(Self(bytes))
    }

    /// Derive the IdentityId of a public key.
    pub fn from_pubkey(pubkey: &XOnlyPublicKey) -> Self {
        Self(sha256(&pubkey.serialize()))
    }

    /// Derive the IdentityId of raw public key bytes.
    pub fn from_public_key_bytes(bytes: &[u8]) -> Self {
        Self(sha256(bytes))
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for IdentityId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
