//! Cryptographic core
//!
//! Provides:
//! - the primitive layer (DH, signatures, AEAD, KDFs)
//! - X3DH key agreement
//! - the double ratchet state machine
//! - base64 codecs for key material

pub mod codec;
pub mod keys;
pub mod primitives;
pub mod ratchet;
pub mod x3dh;

pub use codec::CodecError;
pub use keys::{DhKeyPair, IdentityKeyPair, KeyError, PreKeyBundle};
pub use ratchet::{
    accept_first_message, initialize_session, EncryptedMessage, RatchetError, RatchetState,
};
pub use x3dh::{x3dh_initiator, x3dh_responder, HandshakeError, SharedSecret};
