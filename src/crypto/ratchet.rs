//! Double ratchet state machine
//!
//! A per-step Diffie-Hellman ratchet rotates the root key whenever the peer
//! shows a new ratchet key; a symmetric chain ratchet derives a fresh message
//! key for every message. Functions are pure with respect to their input
//! state and return the successor state alongside their result.
//!
//! No skipped-message cache is kept: walking the receive chain forward
//! discards intermediate message keys, so messages dropped or reordered
//! within a chain are unrecoverable once skipped past.

use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::crypto::codec::{self, CodecError};
use crate::crypto::keys::DhKeyPair;
use crate::crypto::primitives;
use crate::crypto::x3dh::SharedSecret;

/// Info string for deriving the initial root key from the X3DH secret.
const SESSION_INFO: &[u8] = b"DEFCOM-INIT";

/// Ratchet errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RatchetError {
    #[error("message authentication failed")]
    AuthenticationFailed,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("key derivation failed")]
    KeyDerivationFailed,
    #[error("message number {message_number} is behind the receive counter {receive_counter}")]
    CounterReplayed {
        message_number: u32,
        receive_counter: u32,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// One encrypted message as it travels between devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedMessage {
    /// base64 of nonce ‖ AEAD output
    pub ciphertext: String,
    /// Sender's current ratchet public key (base64, 32 bytes)
    pub ratchet_key: String,
    /// Position in the sender's current chain
    pub message_number: u32,
    /// Length of the sender's previous chain
    pub previous_counter: u32,
}

/// Per-session ratchet state.
///
/// `chain_key_receive` and `dh_receive` stay all-zero until the peer's first
/// ratchet key arrives and triggers a DH step.
#[derive(Clone)]
pub struct RatchetState {
    pub(crate) root_key: [u8; 32],
    pub(crate) chain_key_send: [u8; 32],
    pub(crate) chain_key_receive: [u8; 32],
    pub(crate) dh_send: DhKeyPair,
    pub(crate) dh_receive: [u8; 32],
    pub(crate) send_counter: u32,
    pub(crate) receive_counter: u32,
    pub(crate) previous_counter: u32,
}

/// Initiator-side session setup.
///
/// Derives the initial root key from the shared secret, then performs one
/// root-KDF step with a fresh ratchet key pair against the peer's signed
/// prekey to open the send chain.
pub fn initialize_session(
    shared_secret: &SharedSecret,
    dh_send: DhKeyPair,
    peer_ratchet_key: &X25519PublicKey,
) -> Result<RatchetState, RatchetError> {
    let root = derive_initial_root(shared_secret)?;

    let dh_output = primitives::dh(dh_send.secret(), peer_ratchet_key);
    let (root_key, chain_key_send) = primitives::kdf_root_key(&root, &dh_output);

    Ok(RatchetState {
        root_key,
        chain_key_send,
        chain_key_receive: [0u8; 32],
        dh_send,
        dh_receive: peer_ratchet_key.to_bytes(),
        send_counter: 0,
        receive_counter: 0,
        previous_counter: 0,
    })
}

/// Responder-side session setup for the first message from a new peer.
///
/// Our signed prekey key pair stands in as the current ratchet key; the
/// incoming message's ratchet key then triggers the first DH step inside
/// [`RatchetState::decrypt`], opening both chains.
pub fn accept_first_message(
    shared_secret: &SharedSecret,
    signed_prekey: DhKeyPair,
) -> Result<RatchetState, RatchetError> {
    let root_key = derive_initial_root(shared_secret)?;

    Ok(RatchetState {
        root_key,
        chain_key_send: [0u8; 32],
        chain_key_receive: [0u8; 32],
        dh_send: signed_prekey,
        dh_receive: [0u8; 32],
        send_counter: 0,
        receive_counter: 0,
        previous_counter: 0,
    })
}

fn derive_initial_root(shared_secret: &SharedSecret) -> Result<[u8; 32], RatchetError> {
    let mut root = [0u8; 32];
    primitives::hkdf(None, shared_secret.as_bytes(), SESSION_INFO, &mut root)
        .map_err(|_| RatchetError::KeyDerivationFailed)?;
    Ok(root)
}

impl RatchetState {
    /// Encrypt one message, returning the envelope and the successor state.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(EncryptedMessage, RatchetState), RatchetError> {
        let (message_key, next_chain) = primitives::kdf_chain_key(&self.chain_key_send);

        let combined = primitives::aead_encrypt(&message_key, plaintext)
            .map_err(|_| RatchetError::EncryptionFailed)?;

        let message = EncryptedMessage {
            ciphertext: codec::encode_bytes(&combined),
            ratchet_key: codec::encode_public_key(self.dh_send.public().as_bytes()),
            message_number: self.send_counter,
            previous_counter: self.previous_counter,
        };

        let mut next = self.clone();
        next.chain_key_send = next_chain;
        next.send_counter = self.send_counter + 1;

        Ok((message, next))
    }

    /// Decrypt one message, returning the plaintext and the successor state.
    ///
    /// A new ratchet key on the envelope triggers a DH ratchet step first. A
    /// message number behind the receive counter under an unchanged ratchet
    /// key is rejected outright: re-deriving a consumed chain position would
    /// reuse a message key.
    pub fn decrypt(&self, message: &EncryptedMessage) -> Result<(Vec<u8>, RatchetState), RatchetError> {
        let ratchet_key = codec::decode_public_key(&message.ratchet_key)?;

        let mut next = if ratchet_key == self.dh_receive {
            if message.message_number < self.receive_counter {
                return Err(RatchetError::CounterReplayed {
                    message_number: message.message_number,
                    receive_counter: self.receive_counter,
                });
            }
            self.clone()
        } else {
            self.ratchet_step(&ratchet_key)
        };

        // Walk the receive chain up to the envelope's position, discarding
        // the skipped message keys.
        let mut chain_key = next.chain_key_receive;
        for _ in next.receive_counter..message.message_number {
            let (_, advanced) = primitives::kdf_chain_key(&chain_key);
            chain_key = advanced;
        }
        let (message_key, next_chain) = primitives::kdf_chain_key(&chain_key);

        let combined = codec::decode_bytes(&message.ciphertext)?;
        let plaintext = primitives::aead_decrypt(&message_key, &combined)
            .map_err(|_| RatchetError::AuthenticationFailed)?;

        next.chain_key_receive = next_chain;
        next.receive_counter = message.message_number + 1;

        Ok((plaintext, next))
    }

    /// DH ratchet step for an incoming ratchet key: derive the new receive
    /// chain with the current send key, then a new send chain with a fresh
    /// key pair, resetting both counters.
    fn ratchet_step(&self, incoming: &[u8; 32]) -> RatchetState {
        let incoming_key = X25519PublicKey::from(*incoming);

        let dh_receive_out = primitives::dh(self.dh_send.secret(), &incoming_key);
        let (root_key, chain_key_receive) = primitives::kdf_root_key(&self.root_key, &dh_receive_out);

        let fresh = DhKeyPair::generate();
        let dh_send_out = primitives::dh(fresh.secret(), &incoming_key);
        let (root_key, chain_key_send) = primitives::kdf_root_key(&root_key, &dh_send_out);

        RatchetState {
            root_key,
            chain_key_send,
            chain_key_receive,
            dh_send: fresh,
            dh_receive: *incoming,
            send_counter: 0,
            receive_counter: 0,
            previous_counter: self.send_counter,
        }
    }

    /// Our current ratchet public key.
    pub fn ratchet_public(&self) -> &X25519PublicKey {
        self.dh_send.public()
    }

    /// True until the peer's first ratchet key has been mixed in; while this
    /// holds, outgoing messages must still carry the handshake header so the
    /// peer can establish its side of the session.
    pub fn awaiting_first_reply(&self) -> bool {
        self.chain_key_receive == [0u8; 32]
    }
}
