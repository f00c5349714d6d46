//! Primitive layer: Diffie-Hellman, signatures, AEAD, and key derivation
//!
//! Pure functions with no state. Everything above this module (X3DH, the
//! double ratchet, the fallback cipher) is built from these operations.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use ed25519_dalek::{Signature, VerifyingKey, Verifier};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

type HmacSha256 = Hmac<Sha256>;

/// AEAD nonce length (prepended to every ciphertext).
pub const NONCE_LEN: usize = 12;

/// Info string for the root-key KDF.
const ROOT_INFO: &[u8] = b"DEFCOM-ROOT";

const MESSAGE_KEY_CONSTANT: u8 = 0x01;
const CHAIN_KEY_CONSTANT: u8 = 0x02;

/// Primitive-layer errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PrimitiveError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("key derivation failed")]
    KeyDerivationFailed,
}

/// X25519 Diffie-Hellman exchange.
pub fn dh(secret: &StaticSecret, public: &X25519PublicKey) -> [u8; 32] {
    secret.diffie_hellman(public).to_bytes()
}

/// Verify a detached Ed25519 signature over a prekey public.
///
/// Fails closed: malformed keys or signatures return `false`, never panic.
pub fn verify_prekey_signature(
    identity_signing_key: &[u8],
    prekey_public: &[u8],
    signature: &[u8],
) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(identity_signing_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(prekey_public, &signature).is_ok()
}

/// AEAD encryption using AES-256-GCM with a fresh random nonce prepended.
pub fn aead_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, PrimitiveError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| PrimitiveError::EncryptionFailed)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| PrimitiveError::EncryptionFailed)?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend(ciphertext);

    Ok(combined)
}

/// AEAD decryption of a nonce-prepended AES-256-GCM ciphertext.
pub fn aead_decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, PrimitiveError> {
    if data.len() < NONCE_LEN {
        return Err(PrimitiveError::AuthenticationFailed);
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| PrimitiveError::AuthenticationFailed)?;

    let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
    cipher
        .decrypt(nonce, &data[NONCE_LEN..])
        .map_err(|_| PrimitiveError::AuthenticationFailed)
}

/// HKDF-SHA256 extract-then-expand.
///
/// Every output derived here is at most 64 bytes, so a single expand block
/// always suffices.
pub fn hkdf(
    salt: Option<&[u8]>,
    input_key_material: &[u8],
    info: &[u8],
    output: &mut [u8],
) -> Result<(), PrimitiveError> {
    let hk = Hkdf::<Sha256>::new(salt, input_key_material);
    hk.expand(info, output)
        .map_err(|_| PrimitiveError::KeyDerivationFailed)
}

/// Symmetric-chain derivation: `(message_key, next_chain_key)`.
///
/// Keyed-hash ratchet over the chain key; one-way, so a captured chain key
/// never reveals earlier message keys.
pub fn kdf_chain_key(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    (
        hmac_derive(chain_key, MESSAGE_KEY_CONSTANT),
        hmac_derive(chain_key, CHAIN_KEY_CONSTANT),
    )
}

/// Root-key derivation: `(new_root_key, chain_key)` from the current root key
/// and a DH ratchet output.
pub fn kdf_root_key(root_key: &[u8; 32], dh_output: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let hk = Hkdf::<Sha256>::new(Some(root_key), dh_output);
    let mut okm = [0u8; 64];
    // 64 bytes is one expand block; this cannot fail
    hk.expand(ROOT_INFO, &mut okm).unwrap();

    let mut new_root = [0u8; 32];
    let mut chain_key = [0u8; 32];
    new_root.copy_from_slice(&okm[..32]);
    chain_key.copy_from_slice(&okm[32..]);
    (new_root, chain_key)
}

fn hmac_derive(key: &[u8; 32], constant: u8) -> [u8; 32] {
    use hmac::digest::KeyInit;
    // HMAC accepts any key length; 32 bytes cannot fail
    let mut mac = <HmacSha256 as KeyInit>::new_from_slice(key).unwrap();
    mac.update(&[constant]);
    let result = mac.finalize().into_bytes();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}
