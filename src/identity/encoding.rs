//! Hex encoding for keys as they appear in configuration files.

use secp256k1::{SecretKey, XOnlyPublicKey};

use super::IdentityError;

/// Encode a secret key as lowercase hex.
pub fn encode_secret(secret_key: &SecretKey) -> String {
    hex::encode(secret_key.secret_bytes())
}

/// Decode a hex-encoded 32-byte secret key.
pub fn decode_secret(s: &str) -> Result<SecretKey, IdentityError> {
    let bytes = hex::decode(s.trim())?;
    if bytes.len() != 32 {
        return Err(IdentityError::InvalidSecretLength(bytes.len()));
    }
    Ok(SecretKey::from_slice(&bytes)?)
}

/// Decode a hex-encoded 32-byte x-only public key.
pub fn decode_public_key(s: &str) -> Result<XOnlyPublicKey, IdentityError> {
    let bytes = hex::decode(s.trim())?;
    if bytes.len() != 32 {
        return Err(IdentityError::InvalidPublicKeyLength(bytes.len()));
    }
    Ok(XOnlyPublicKey::from_slice(&bytes)?)
}
