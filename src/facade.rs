//! Secure messaging facade
//!
//! Orchestrates the device registry, session store, and ratchet engine
//! behind two calls: encrypt and decrypt. Any failure along the ratchet path
//! degrades to the fallback cipher rather than losing the message — an
//! availability-over-confidentiality trade, surfaced to operators through
//! the [`Readiness`] capability and warn-level logs.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::MessagingConfig;
use crate::crypto::ratchet::EncryptedMessage;
use crate::fallback::{FallbackCipher, FallbackOutcome};
use crate::registry::DeviceRegistry;
use crate::session::{HandshakeHeader, SessionStore};

/// Whether the ratchet path is available, decided once at initialization.
///
/// Returned as an explicit capability instead of a process-global flag;
/// callers can inspect it to alert on silently degraded confidentiality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready { device_id: String },
    Degraded { reason: String },
}

/// Where a decrypted plaintext came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaintextSource {
    /// The double-ratchet session path.
    Ratchet,
    /// The deployment-keyed fallback cipher.
    Fallback,
    /// The envelope was never encrypted.
    Plain,
}

/// The discriminated result of a decrypt call. An undecryptable envelope is
/// reported as [`DecryptOutcome::Failed`], never echoed back as plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptOutcome {
    Decrypted {
        text: String,
        source: PlaintextSource,
    },
    Failed {
        reason: String,
    },
}

impl DecryptOutcome {
    pub fn text(&self) -> Option<&str> {
        match self {
            DecryptOutcome::Decrypted { text, .. } => Some(text),
            DecryptOutcome::Failed { .. } => None,
        }
    }
}

/// Wire payload for one message as stored in the message row.
///
/// `encrypted` discriminates real ciphertext from a plaintext the facade had
/// to pass through when even the fallback cipher was unavailable. Ratchet
/// metadata is absent on fallback envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub ciphertext: String,
    pub encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratchet_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_counter: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake: Option<HandshakeHeader>,
}

impl MessageEnvelope {
    /// Reassemble the ratchet message when the envelope carries one.
    pub fn ratchet_message(&self) -> Option<EncryptedMessage> {
        match (&self.ratchet_key, self.message_number) {
            (Some(ratchet_key), Some(message_number)) => Some(EncryptedMessage {
                ciphertext: self.ciphertext.clone(),
                ratchet_key: ratchet_key.clone(),
                message_number,
                previous_counter: self.previous_counter.unwrap_or(0),
            }),
            _ => None,
        }
    }

    fn fallback(ciphertext: String) -> Self {
        Self {
            ciphertext,
            encrypted: true,
            ratchet_key: None,
            message_number: None,
            previous_counter: None,
            sender_device_id: None,
            handshake: None,
        }
    }

    fn plain(text: String) -> Self {
        Self {
            ciphertext: text,
            encrypted: false,
            ratchet_key: None,
            message_number: None,
            previous_counter: None,
            sender_device_id: None,
            handshake: None,
        }
    }
}

/// End-to-end encrypted messaging for one device.
pub struct SecureMessaging {
    sessions: Arc<SessionStore>,
    fallback: FallbackCipher,
    readiness: Readiness,
}

impl SecureMessaging {
    /// Drive device registration and capture the outcome. Never fails: a
    /// broken registry yields a facade that is up but degraded to the
    /// fallback cipher.
    pub async fn initialize(
        registry: Arc<DeviceRegistry>,
        sessions: Arc<SessionStore>,
        config: &MessagingConfig,
        user_id: &str,
    ) -> Self {
        let readiness = match registry.initialize(user_id).await {
            Ok(device_id) => {
                info!(%device_id, user_id, "secure messaging ready");
                Readiness::Ready { device_id }
            }
            Err(error) => {
                error!(%error, user_id, "device initialization failed; falling back to static-key encryption");
                Readiness::Degraded {
                    reason: error.to_string(),
                }
            }
        };

        Self {
            sessions,
            fallback: FallbackCipher::new(&config.fallback_secret),
            readiness,
        }
    }

    /// The capability decided at initialization.
    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.readiness, Readiness::Ready { .. })
    }

    /// Encrypt a message for a conversation. Ratchet path when ready, the
    /// fallback cipher on any error, a plaintext envelope as the last resort.
    pub async fn encrypt(
        &self,
        conversation_id: &str,
        recipient_user_id: &str,
        plaintext: &str,
    ) -> MessageEnvelope {
        if self.is_ready() {
            match self
                .sessions
                .encrypt_message(conversation_id, recipient_user_id, plaintext)
                .await
            {
                Ok(outbound) => {
                    return MessageEnvelope {
                        ciphertext: outbound.message.ciphertext,
                        encrypted: true,
                        ratchet_key: Some(outbound.message.ratchet_key),
                        message_number: Some(outbound.message.message_number),
                        previous_counter: Some(outbound.message.previous_counter),
                        sender_device_id: Some(outbound.sender_device_id),
                        handshake: outbound.handshake,
                    };
                }
                Err(error) => {
                    warn!(%error, conversation_id, "ratchet encryption failed, using fallback cipher");
                }
            }
        } else {
            warn!(conversation_id, "ratchet path unavailable, using fallback cipher");
        }

        match self.fallback.encrypt(plaintext) {
            Some(ciphertext) => MessageEnvelope::fallback(ciphertext),
            None => MessageEnvelope::plain(plaintext.to_string()),
        }
    }

    /// Decrypt an envelope. Envelopes without ratchet metadata, a degraded
    /// facade, and ratchet failures all route to the fallback cipher.
    pub async fn decrypt(
        &self,
        conversation_id: &str,
        sender_user_id: &str,
        envelope: &MessageEnvelope,
    ) -> DecryptOutcome {
        if !envelope.encrypted {
            return DecryptOutcome::Decrypted {
                text: envelope.ciphertext.clone(),
                source: PlaintextSource::Plain,
            };
        }

        if let Some(message) = envelope.ratchet_message() {
            if self.is_ready() {
                match self
                    .sessions
                    .decrypt_message(
                        conversation_id,
                        sender_user_id,
                        &message,
                        envelope.handshake.as_ref(),
                    )
                    .await
                {
                    Ok(text) => {
                        return DecryptOutcome::Decrypted {
                            text,
                            source: PlaintextSource::Ratchet,
                        };
                    }
                    Err(error) => {
                        warn!(%error, conversation_id, "ratchet decryption failed, trying fallback cipher");
                    }
                }
            } else {
                warn!(conversation_id, "ratchet path unavailable, trying fallback cipher");
            }
        }

        match self.fallback.decrypt(&envelope.ciphertext) {
            FallbackOutcome::Decrypted(text) => DecryptOutcome::Decrypted {
                text,
                source: PlaintextSource::Fallback,
            },
            FallbackOutcome::Failed(reason) => DecryptOutcome::Failed { reason },
        }
    }
}
