//! Random challenges for the conversation handshake.

use rand::Rng;
use std::fmt;

use super::IdentityError;

/// Size in bytes of an authentication challenge.
pub const CHALLENGE_SIZE: usize = 32;

/// A 32-byte random authentication challenge.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Challenge([u8; CHALLENGE_SIZE]);

impl Challenge {
    /// Generate a new random challenge.
    pub fn generate() -> Self {
        let mut bytes = [0u8; CHALLENGE_SIZE];
        rand::rng().fill(&mut bytes);
        Self(bytes)
    }

    /// Create a challenge from bytes.
    pub fn from_bytes(bytes: [u8; CHALLENGE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a challenge from a slice, checking its length.
    pub fn from_slice(slice: &[u8]) -> Result<Self, IdentityError> {
        let bytes: [u8; CHALLENGE_SIZE] = slice
            .try_into()
            .map_err(|_| IdentityError::InvalidChallengeLength(slice.len()))?;
        Ok(Self(bytes))
    }

    /// Return the challenge bytes.
    pub fn as_bytes(&self) -> &[u8; CHALLENGE_SIZE] {
        &self.0
    }

    /// Return the challenge as an owned byte vector, as carried on the wire.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Challenge({})", hex::encode(&self.0[..8]))
    }
}
