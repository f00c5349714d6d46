//! Flat serialized form of the ratchet state
//!
//! One JSON shape serves the vault cache; the same fields minus the private
//! key half become the remote row patch. All keys are base64, counters stay
//! integers.

use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::crypto::codec;
use crate::crypto::keys::DhKeyPair;
use crate::crypto::ratchet::RatchetState;
use crate::session::SessionError;
use crate::store::SessionPatch;

/// Vault-cached ratchet state. Carries the dh-send key pair blob, so it must
/// never be written anywhere but the local vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRatchetState {
    pub root_key: String,
    pub chain_key_send: String,
    pub chain_key_receive: String,
    /// Key pair blob (public ‖ secret)
    pub dh_send: String,
    pub dh_receive: String,
    pub send_counter: u32,
    pub receive_counter: u32,
    pub previous_counter: u32,
}

impl StoredRatchetState {
    pub fn from_state(state: &RatchetState) -> Self {
        Self {
            root_key: codec::encode_public_key(&state.root_key),
            chain_key_send: codec::encode_public_key(&state.chain_key_send),
            chain_key_receive: codec::encode_public_key(&state.chain_key_receive),
            dh_send: state.dh_send.to_base64(),
            dh_receive: codec::encode_public_key(&state.dh_receive),
            send_counter: state.send_counter,
            receive_counter: state.receive_counter,
            previous_counter: state.previous_counter,
        }
    }

    pub fn into_state(self) -> Result<RatchetState, SessionError> {
        Ok(RatchetState {
            root_key: codec::decode_public_key(&self.root_key)?,
            chain_key_send: codec::decode_public_key(&self.chain_key_send)?,
            chain_key_receive: codec::decode_public_key(&self.chain_key_receive)?,
            dh_send: DhKeyPair::from_base64(&self.dh_send)?,
            dh_receive: codec::decode_public_key(&self.dh_receive)?,
            send_counter: self.send_counter,
            receive_counter: self.receive_counter,
            previous_counter: self.previous_counter,
        })
    }

    pub fn to_json(&self) -> Result<String, SessionError> {
        serde_json::to_string(self).map_err(|e| SessionError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        serde_json::from_str(json).map_err(|e| SessionError::Serialization(e.to_string()))
    }
}

/// The remote-row view of a state: public halves only.
pub fn patch_from_state(state: &RatchetState) -> SessionPatch {
    SessionPatch {
        root_key: codec::encode_public_key(&state.root_key),
        chain_key_send: codec::encode_public_key(&state.chain_key_send),
        chain_key_receive: codec::encode_public_key(&state.chain_key_receive),
        send_counter: state.send_counter,
        receive_counter: state.receive_counter,
        previous_counter: state.previous_counter,
        dh_send_public: codec::encode_public_key(state.dh_send.public().as_bytes()),
        dh_receive: codec::encode_public_key(&state.dh_receive),
    }
}

/// Rebuild a state from a remote row joined with the locally held dh-send
/// key pair.
pub fn state_from_row_fields(
    root_key: &str,
    chain_key_send: &str,
    chain_key_receive: &str,
    dh_send: DhKeyPair,
    dh_receive: &str,
    send_counter: u32,
    receive_counter: u32,
    previous_counter: u32,
) -> Result<RatchetState, SessionError> {
    Ok(RatchetState {
        root_key: codec::decode_public_key(root_key)?,
        chain_key_send: codec::decode_public_key(chain_key_send)?,
        chain_key_receive: codec::decode_public_key(chain_key_receive)?,
        dh_send,
        dh_receive: codec::decode_public_key(dh_receive)?,
        send_counter,
        receive_counter,
        previous_counter,
    })
}

pub(crate) fn public_key_from_b64(encoded: &str) -> Result<X25519PublicKey, SessionError> {
    Ok(X25519PublicKey::from(codec::decode_public_key(encoded)?))
}
