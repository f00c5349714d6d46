//! Cryptographic key types
//!
//! Identity key pairs, ratchet/prekey key pairs, and the published prekey
//! bundle used to bootstrap sessions.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::crypto::codec::{self, CodecError};

/// Key-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyError {
    #[error("invalid key format")]
    InvalidFormat,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Identity key pair (Ed25519 for signing, X25519 for key exchange)
///
/// The X25519 half is derived from the Ed25519 seed so one 64-byte blob
/// captures the whole identity.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
    x25519_secret: StaticSecret,
    x25519_public: X25519PublicKey,
}

impl IdentityKeyPair {
    /// Generate a new identity key pair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);

        let seed = signing_key.to_bytes();
        let x25519_secret = StaticSecret::from(seed);
        let x25519_public = X25519PublicKey::from(&x25519_secret);

        Self {
            signing_key,
            x25519_secret,
            x25519_public,
        }
    }

    /// The Ed25519 public key peers use to check prekey signatures.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// The X25519 public key used in key agreement.
    pub fn public_key(&self) -> &X25519PublicKey {
        &self.x25519_public
    }

    pub(crate) fn dh_secret(&self) -> &StaticSecret {
        &self.x25519_secret
    }

    /// Sign data with the identity signing key.
    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }

    /// Serialize for vault storage: base64 of signing seed ‖ X25519 secret.
    pub fn to_base64(&self) -> String {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.signing_key.to_bytes());
        bytes[32..].copy_from_slice(&self.x25519_secret.to_bytes());
        codec::encode_bytes(&bytes)
    }

    /// Restore from a vault blob.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let bytes = codec::decode_bytes(encoded)?;
        if bytes.len() != 64 {
            return Err(KeyError::InvalidFormat);
        }

        let seed: [u8; 32] = bytes[..32].try_into().map_err(|_| KeyError::InvalidFormat)?;
        let signing_key = SigningKey::from_bytes(&seed);

        let secret: [u8; 32] = bytes[32..].try_into().map_err(|_| KeyError::InvalidFormat)?;
        let x25519_secret = StaticSecret::from(secret);
        let x25519_public = X25519PublicKey::from(&x25519_secret);

        Ok(Self {
            signing_key,
            x25519_secret,
            x25519_public,
        })
    }
}

/// X25519 key pair used for signed prekeys, one-time prekeys, ephemerals and
/// ratchet keys.
#[derive(Clone)]
pub struct DhKeyPair {
    secret: StaticSecret,
    public: X25519PublicKey,
}

impl DhKeyPair {
    /// Generate a fresh key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public(&self) -> &X25519PublicKey {
        &self.public
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Serialize for vault storage: base64 of public ‖ secret.
    pub fn to_base64(&self) -> String {
        codec::encode_keypair_blob(self.public.as_bytes(), &self.secret.to_bytes())
    }

    /// Restore from a vault blob.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let (public, secret) = codec::decode_keypair_blob(encoded)?;
        Ok(Self {
            secret: StaticSecret::from(secret),
            public: X25519PublicKey::from(public),
        })
    }
}

/// A peer device's published key material, used once to bootstrap a session.
#[derive(Clone)]
pub struct PreKeyBundle {
    /// X25519 identity key (key agreement)
    pub identity_key: X25519PublicKey,
    /// Ed25519 identity key (signature checks)
    pub identity_signing_key: VerifyingKey,
    /// Signed prekey
    pub signed_prekey: X25519PublicKey,
    /// Identity signature over the signed prekey public bytes
    pub prekey_signature: Signature,
    /// Optional one-time prekey
    pub one_time_prekey: Option<X25519PublicKey>,
}

impl PreKeyBundle {
    /// Build a bundle from our own key material (the publishing side).
    pub fn new(
        identity: &IdentityKeyPair,
        signed_prekey: &DhKeyPair,
        one_time_prekey: Option<&DhKeyPair>,
    ) -> Self {
        Self {
            identity_key: *identity.public_key(),
            identity_signing_key: identity.verifying_key(),
            signed_prekey: *signed_prekey.public(),
            prekey_signature: identity.sign(signed_prekey.public().as_bytes()),
            one_time_prekey: one_time_prekey.map(|k| *k.public()),
        }
    }

    /// Parse a bundle from stored row fields (all base64).
    pub fn from_encoded(
        identity_key: &str,
        identity_signing_key: &str,
        signed_prekey: &str,
        prekey_signature: &str,
        one_time_prekey: Option<&str>,
    ) -> Result<Self, KeyError> {
        let identity_key = X25519PublicKey::from(codec::decode_public_key(identity_key)?);
        let identity_signing_key =
            VerifyingKey::from_bytes(&codec::decode_public_key(identity_signing_key)?)
                .map_err(|_| KeyError::InvalidFormat)?;
        let signed_prekey = X25519PublicKey::from(codec::decode_public_key(signed_prekey)?);
        let prekey_signature = Signature::from_bytes(&codec::decode_signature(prekey_signature)?);
        let one_time_prekey = match one_time_prekey {
            Some(encoded) => Some(X25519PublicKey::from(codec::decode_public_key(encoded)?)),
            None => None,
        };

        Ok(Self {
            identity_key,
            identity_signing_key,
            signed_prekey,
            prekey_signature,
            one_time_prekey,
        })
    }

    /// Verify the prekey signature. Fails closed.
    pub fn verify(&self) -> bool {
        self.identity_signing_key
            .verify(self.signed_prekey.as_bytes(), &self.prekey_signature)
            .is_ok()
    }
}
