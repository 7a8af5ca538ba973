//! Identity System
//!
//! Server and peer identities are secp256k1 keypairs. Signatures are BIP-340
//! Schnorr signatures over the SHA-256 digest of the signed bytes. The
//! identity ID of a peer is the SHA-256 hash of its 32-byte public key.

mod auth;
mod encoding;
mod identity_id;
mod local;
mod peer;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub use auth::{Challenge, CHALLENGE_SIZE};
pub use encoding::{decode_public_key, decode_secret, encode_secret};
pub use identity_id::IdentityId;
pub use local::Identity;
pub use peer::PeerIdentity;

/// Size in bytes of a serialized public key.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size in bytes of a serialized signature.
pub const SIGNATURE_SIZE: usize = 64;

/// Errors that can occur in identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid key: {0}")]
    InvalidKey(#[from] secp256k1::Error),

    #[error("invalid secret key length: expected 32, got {0}")]
    InvalidSecretLength(usize),

    #[error("invalid public key length: expected 32, got {0}")]
    InvalidPublicKeyLength(usize),

    #[error("invalid identity id length: expected 32, got {0}")]
    InvalidIdentityIdLength(usize),

    #[error("invalid challenge length: expected 32, got {0}")]
    InvalidChallengeLength(usize),

    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Compute SHA-256 hash of data.
fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}
