//! Remote peer identity (public key only, no signing capability).

use secp256k1::{schnorr, Secp256k1, XOnlyPublicKey};
use std::fmt;

use super::encoding::decode_public_key;
use super::{sha256, IdentityError, IdentityId, PUBLIC_KEY_SIZE};

/// A remote peer's identity (public key only, no signing capability).
///
/// Sessions learn a peer identity from the public key declared in
/// `StartConversationRequest`; it is only trusted once the peer has signed
/// the server's challenge with it.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    pubkey: XOnlyPublicKey,
    identity_id: IdentityId,
}

impl PeerIdentity {
    /// Create a PeerIdentity from an x-only public key.
    pub fn from_pubkey(pubkey: XOnlyPublicKey) -> Self {
        Self {
            pubkey,
            identity_id: IdentityId::from_pubkey(&pubkey),
        }
    }

    /// Create a PeerIdentity from serialized public key bytes.
    pub fn from_public_key_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(IdentityError::InvalidPublicKeyLength(bytes.len()));
        }
        let pubkey = XOnlyPublicKey::from_slice(bytes)?;
        Ok(Self::from_pubkey(pubkey))
    }

    /// Create a PeerIdentity from a hex-encoded public key.
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        Ok(Self::from_pubkey(decode_public_key(s)?))
    }

    /// Return the x-only public key.
    pub fn pubkey(&self) -> XOnlyPublicKey {
        self.pubkey
    }

    /// Return the serialized public key.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.pubkey.serialize()
    }

    /// Return the identity ID.
    pub fn identity_id(&self) -> &IdentityId {
        &self.identity_id
    }

    /// Verify a signature from this peer.
    pub fn verify(&self, data: &[u8], signature: &schnorr::Signature) -> bool {
        let secp = Secp256k1::verification_only();
        let digest = sha256(data);
        secp.verify_schnorr(signature, &digest, &self.pubkey).is_ok()
    }

    /// Verify a serialized signature from this peer.
    ///
    /// Malformed or missing signatures verify as `false`.
    pub fn verify_bytes(&self, data: &[u8], signature: &[u8]) -> bool {
        match schnorr::Signature::from_slice(signature) {
            Ok(signature) => self.verify(data, &signature),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("identity_id", &self.identity_id)
            .finish()
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.pubkey.serialize()))
    }
}
