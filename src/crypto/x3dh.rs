//! X3DH key agreement
//!
//! Asynchronous handshake combining identity, signed, and (when available)
//! one-time prekeys into a single 32-byte shared secret. The initiator works
//! from the peer's published bundle; the responder mirrors the computation
//! from the initiator's identity and ephemeral keys carried on the first
//! message.

use x25519_dalek::PublicKey as X25519PublicKey;
use zeroize::Zeroize;

use crate::crypto::keys::{DhKeyPair, IdentityKeyPair, PreKeyBundle};
use crate::crypto::primitives;

/// Info string for the shared-secret KDF.
const X3DH_INFO: &[u8] = b"DEFCOM-E2EE-V1";

/// Key-agreement errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandshakeError {
    #[error("invalid prekey signature")]
    InvalidPreKeySignature,
    #[error("key derivation failed")]
    KeyDerivationFailed,
}

/// The agreed 32-byte secret. Zeroed on drop.
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Initiator side of the handshake.
///
/// Verifies the bundle signature before any DH is computed, then derives
/// DH1 = DH(identity, peer signed prekey), DH2 = DH(ephemeral, peer identity),
/// DH3 = DH(ephemeral, peer signed prekey) and, when the bundle carries a
/// one-time prekey, DH4 = DH(ephemeral, peer one-time prekey).
pub fn x3dh_initiator(
    identity: &IdentityKeyPair,
    ephemeral: &DhKeyPair,
    bundle: &PreKeyBundle,
) -> Result<SharedSecret, HandshakeError> {
    if !bundle.verify() {
        return Err(HandshakeError::InvalidPreKeySignature);
    }

    let dh1 = primitives::dh(identity.dh_secret(), &bundle.signed_prekey);
    let dh2 = primitives::dh(ephemeral.secret(), &bundle.identity_key);
    let dh3 = primitives::dh(ephemeral.secret(), &bundle.signed_prekey);
    let dh4 = bundle
        .one_time_prekey
        .as_ref()
        .map(|otpk| primitives::dh(ephemeral.secret(), otpk));

    derive_secret(dh1, dh2, dh3, dh4)
}

/// Responder side of the handshake: the mirror computation with reversed
/// roles, using our private prekey halves against the initiator's public
/// identity and ephemeral keys.
pub fn x3dh_responder(
    identity: &IdentityKeyPair,
    signed_prekey: &DhKeyPair,
    one_time_prekey: Option<&DhKeyPair>,
    initiator_identity: &X25519PublicKey,
    initiator_ephemeral: &X25519PublicKey,
) -> Result<SharedSecret, HandshakeError> {
    let dh1 = primitives::dh(signed_prekey.secret(), initiator_identity);
    let dh2 = primitives::dh(identity.dh_secret(), initiator_ephemeral);
    let dh3 = primitives::dh(signed_prekey.secret(), initiator_ephemeral);
    let dh4 = one_time_prekey.map(|otpk| primitives::dh(otpk.secret(), initiator_ephemeral));

    derive_secret(dh1, dh2, dh3, dh4)
}

fn derive_secret(
    dh1: [u8; 32],
    dh2: [u8; 32],
    dh3: [u8; 32],
    dh4: Option<[u8; 32]>,
) -> Result<SharedSecret, HandshakeError> {
    let mut combined = Vec::with_capacity(128);
    combined.extend_from_slice(&dh1);
    combined.extend_from_slice(&dh2);
    combined.extend_from_slice(&dh3);
    if let Some(dh4) = dh4 {
        combined.extend_from_slice(&dh4);
    }

    let mut secret = [0u8; 32];
    let derived = primitives::hkdf(None, &combined, X3DH_INFO, &mut secret)
        .map(|()| SharedSecret(secret))
        .map_err(|_| HandshakeError::KeyDerivationFailed);
    combined.zeroize();
    derived
}
