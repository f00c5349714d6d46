//! Base64 codecs for key material
//!
//! Public keys travel as base64 of exactly 32 raw bytes. Key pairs are stored
//! only in the local vault as base64 of 64 bytes (public ‖ secret). The two
//! forms are deliberately separate codecs and never interchangeable.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Raw length of an X25519 or Ed25519 public key.
pub const KEY_LEN: usize = 32;

/// Raw length of a detached Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Codec errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

/// Encode arbitrary bytes (ciphertexts, blobs) as base64.
pub fn encode_bytes(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode arbitrary base64 bytes.
pub fn decode_bytes(encoded: &str) -> Result<Vec<u8>, CodecError> {
    Ok(BASE64.decode(encoded)?)
}

/// Encode a single public key.
pub fn encode_public_key(key: &[u8; KEY_LEN]) -> String {
    BASE64.encode(key)
}

/// Decode a single public key, rejecting any length other than 32 bytes.
pub fn decode_public_key(encoded: &str) -> Result<[u8; KEY_LEN], CodecError> {
    let bytes = BASE64.decode(encoded)?;
    let mut key = [0u8; KEY_LEN];
    if bytes.len() != KEY_LEN {
        return Err(CodecError::Length {
            expected: KEY_LEN,
            actual: bytes.len(),
        });
    }
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Decode a detached signature (64 bytes).
pub fn decode_signature(encoded: &str) -> Result<[u8; SIGNATURE_LEN], CodecError> {
    let bytes = BASE64.decode(encoded)?;
    let mut sig = [0u8; SIGNATURE_LEN];
    if bytes.len() != SIGNATURE_LEN {
        return Err(CodecError::Length {
            expected: SIGNATURE_LEN,
            actual: bytes.len(),
        });
    }
    sig.copy_from_slice(&bytes);
    Ok(sig)
}

/// Encode a key pair blob (public ‖ secret) for vault storage.
pub fn encode_keypair_blob(public: &[u8; KEY_LEN], secret: &[u8; KEY_LEN]) -> String {
    let mut combined = [0u8; KEY_LEN * 2];
    combined[..KEY_LEN].copy_from_slice(public);
    combined[KEY_LEN..].copy_from_slice(secret);
    BASE64.encode(combined)
}

/// Decode a vault key pair blob into (public, secret).
pub fn decode_keypair_blob(encoded: &str) -> Result<([u8; KEY_LEN], [u8; KEY_LEN]), CodecError> {
    let bytes = BASE64.decode(encoded)?;
    if bytes.len() != KEY_LEN * 2 {
        return Err(CodecError::Length {
            expected: KEY_LEN * 2,
            actual: bytes.len(),
        });
    }
    let mut public = [0u8; KEY_LEN];
    let mut secret = [0u8; KEY_LEN];
    public.copy_from_slice(&bytes[..KEY_LEN]);
    secret.copy_from_slice(&bytes[KEY_LEN..]);
    Ok((public, secret))
}
