//! Fallback cipher
//!
//! Symmetric encryption under a single deployment-wide secret, used when the
//! ratchet path is unavailable. No per-message forward secrecy: the same key
//! covers every message in every conversation, which makes this strictly
//! weaker than the ratchet path and purely an availability measure.
//!
//! Neither operation ever fails loudly: encryption degrades to returning
//! nothing to encrypt with, and decryption reports an explicit
//! [`FallbackOutcome::Failed`] instead of echoing input back as plaintext.

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::crypto::codec;
use crate::crypto::primitives;

/// The result of a fallback decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackOutcome {
    Decrypted(String),
    Failed(String),
}

impl FallbackOutcome {
    /// The plaintext, when decryption succeeded.
    pub fn text(&self) -> Option<&str> {
        match self {
            FallbackOutcome::Decrypted(text) => Some(text),
            FallbackOutcome::Failed(_) => None,
        }
    }
}

/// AES-256-GCM under a key derived from a static secret.
pub struct FallbackCipher {
    key: [u8; 32],
}

impl FallbackCipher {
    /// Derive the cipher key as SHA-256 of the deployment secret.
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Encrypt a message, returning base64 of nonce ‖ AEAD output.
    ///
    /// `None` means encryption itself failed and nothing safe to send exists.
    pub fn encrypt(&self, plaintext: &str) -> Option<String> {
        if plaintext.is_empty() {
            return Some(String::new());
        }

        match primitives::aead_encrypt(&self.key, plaintext.as_bytes()) {
            Ok(combined) => Some(codec::encode_bytes(&combined)),
            Err(error) => {
                warn!(%error, "fallback encryption failed");
                None
            }
        }
    }

    /// Decrypt a fallback ciphertext. Never panics; every failure mode comes
    /// back as [`FallbackOutcome::Failed`].
    pub fn decrypt(&self, ciphertext: &str) -> FallbackOutcome {
        if ciphertext.is_empty() {
            return FallbackOutcome::Decrypted(String::new());
        }

        let combined = match codec::decode_bytes(ciphertext) {
            Ok(bytes) => bytes,
            Err(_) => return FallbackOutcome::Failed("ciphertext is not valid base64".to_string()),
        };

        if combined.len() <= primitives::NONCE_LEN {
            return FallbackOutcome::Failed("ciphertext too short".to_string());
        }

        let plaintext = match primitives::aead_decrypt(&self.key, &combined) {
            Ok(bytes) => bytes,
            Err(_) => return FallbackOutcome::Failed("authentication failed".to_string()),
        };

        match String::from_utf8(plaintext) {
            Ok(text) => FallbackOutcome::Decrypted(text),
            Err(_) => FallbackOutcome::Failed("plaintext is not valid UTF-8".to_string()),
        }
    }
}
