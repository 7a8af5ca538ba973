//! Local identity with signing capability.

use rand::RngCore;
use secp256k1::{schnorr, Keypair, Secp256k1, SecretKey, XOnlyPublicKey};
use std::fmt;

use super::encoding::decode_secret;
use super::{sha256, IdentityError, IdentityId, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};

/// A server or client identity consisting of a keypair and its identity ID.
///
/// The identity holds the secp256k1 keypair and signs protocol message
/// bodies. Signatures are Schnorr signatures over SHA-256(data).
pub struct Identity {
    keypair: Keypair,
    identity_id: IdentityId,
}

impl Identity {
    /// Create a new random identity.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        loop {
            let mut secret_bytes = [0u8; 32];
            rng.fill_bytes(&mut secret_bytes);
            // Out-of-range scalars are astronomically rare; draw again.
            if let Ok(secret_key) = SecretKey::from_slice(&secret_bytes) {
                return Self::from_secret_key(secret_key);
            }
        }
    }

    /// Create an identity from an existing keypair.
    pub fn from_keypair(keypair: Keypair) -> Self {
        let (pubkey, _parity) = keypair.x_only_public_key();
        Self {
            keypair,
            identity_id: IdentityId::from_pubkey(&pubkey),
        }
    }

    /// Create an identity from a secret key.
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &secret_key);
        Self::from_keypair(keypair)
    }

    /// Create an identity from secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, IdentityError> {
        let secret_key = SecretKey::from_slice(bytes)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Create an identity from a hex-encoded secret.
    pub fn from_secret_str(s: &str) -> Result<Self, IdentityError> {
        let secret_key = decode_secret(s)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Return the secret key.
    pub fn secret_key(&self) -> SecretKey {
        self.keypair.secret_key()
    }

    /// Return the x-only public key.
    pub fn pubkey(&self) -> XOnlyPublicKey {
        self.keypair.x_only_public_key().0
    }

    /// Return the serialized public key as carried in protocol messages.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.pubkey().serialize()
    }

    /// Return the identity ID.
    pub fn identity_id(&self) -> &IdentityId {
        &self.identity_id
    }

    /// Sign arbitrary data with this identity's secret key.
    pub fn sign(&self, data: &[u8]) -> schnorr::Signature {
        let secp = Secp256k1::new();
        let digest = sha256(data);
        let mut aux_rand = [0u8; 32];
        rand::rng().fill_bytes(&mut aux_rand);
        secp.sign_schnorr_with_aux_rand(&digest, &self.keypair, &aux_rand)
    }

    /// Sign data and return the serialized 64-byte signature.
    pub fn sign_bytes(&self, data: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.sign(data).serialize()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("identity_id", &self.identity_id)
            .finish_non_exhaustive()
    }
}
