//! Session store
//!
//! Maps (conversation, sender device, receiver device) to persisted ratchet
//! state. State loads cache-first from the vault with the remote row as the
//! durable fallback, and every save writes through to both. The facade-facing
//! [`SessionStore::encrypt_message`] / [`SessionStore::decrypt_message`]
//! bracket exactly one ratchet call with a load and a save, holding a
//! per-session lock so concurrent calls on one session cannot interleave
//! their read-modify-write cycles.

mod state;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

use crate::crypto::codec::{self, CodecError};
use crate::crypto::keys::{DhKeyPair, KeyError};
use crate::crypto::ratchet::{
    accept_first_message, initialize_session, EncryptedMessage, RatchetError, RatchetState,
};
use crate::crypto::x3dh::{x3dh_initiator, x3dh_responder, HandshakeError};
use crate::registry::{DeviceRegistry, RegistryError};
use crate::store::{KeyVault, NewSession, SessionDirectory, StoreError};

pub use state::StoredRatchetState;

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no session for conversation {conversation_id} and no handshake to bootstrap one")]
    NoSessionFound { conversation_id: String },
    #[error("session {session_id} has no local key material on this device")]
    SendKeyUnavailable { session_id: String },
    #[error("one-time prekey from handshake is not available on this device")]
    UnknownOneTimePreKey,
    #[error("decrypted payload is not valid UTF-8")]
    MalformedPlaintext,
    #[error("session state serialization failed: {0}")]
    Serialization(String),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Ratchet(#[from] RatchetError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// First-message metadata the responder needs to establish its side of the
/// session: the initiator's identity and ephemeral publics, plus the
/// one-time prekey (by value) it consumed from our pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeHeader {
    pub identity_key: String,
    pub ephemeral_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_time_prekey: Option<String>,
}

/// A loaded session: row id plus its current ratchet state.
pub struct ActiveSession {
    pub session_id: String,
    pub state: RatchetState,
}

/// The result of an outbound encryption.
pub struct OutboundMessage {
    pub message: EncryptedMessage,
    /// Present until the peer's first reply has been mixed in.
    pub handshake: Option<HandshakeHeader>,
    pub sender_device_id: String,
}

fn session_cache_key(session_id: &str) -> String {
    format!("session_{session_id}")
}

fn session_dh_key(session_id: &str) -> String {
    format!("session_dh_{session_id}")
}

/// One session serves both directions of a device pair, so the lock key
/// orders the ids to make encrypt and decrypt contend on the same mutex.
fn lock_key(conversation_id: &str, device_a: &str, device_b: &str) -> String {
    if device_a <= device_b {
        format!("{conversation_id}:{device_a}:{device_b}")
    } else {
        format!("{conversation_id}:{device_b}:{device_a}")
    }
}

/// Persisted ratchet sessions for this device.
pub struct SessionStore {
    registry: Arc<DeviceRegistry>,
    sessions: Arc<dyn SessionDirectory>,
    vault: Arc<dyn KeyVault>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        sessions: Arc<dyn SessionDirectory>,
        vault: Arc<dyn KeyVault>,
    ) -> Self {
        Self {
            registry,
            sessions,
            vault,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Serialize all work on one (conversation, device pair) session.
    async fn lock_for(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Load the session for a conversation with a recipient, running the full
    /// initiator handshake when none exists yet.
    pub async fn get_or_create_session(
        &self,
        conversation_id: &str,
        recipient_user_id: &str,
    ) -> Result<ActiveSession, SessionError> {
        let own_device = self.registry.device_id().await?;
        let recipient_device = self.registry.latest_device(recipient_user_id).await?;

        let _guard = self
            .lock_for(&lock_key(conversation_id, &own_device, &recipient_device.id))
            .await;
        self.get_or_create_locked(
            conversation_id,
            recipient_user_id,
            &own_device,
            &recipient_device.id,
        )
        .await
    }

    async fn get_or_create_locked(
        &self,
        conversation_id: &str,
        recipient_user_id: &str,
        own_device_id: &str,
        recipient_device_id: &str,
    ) -> Result<ActiveSession, SessionError> {
        if let Some(row) = self
            .sessions
            .find_session(conversation_id, own_device_id, recipient_device_id)
            .await?
        {
            let state = self.load_session_state(&row.id).await?;
            return Ok(ActiveSession {
                session_id: row.id,
                state,
            });
        }

        // A session the peer initiated serves both directions once this
        // device has bootstrapped its side of it
        if let Some(row) = self
            .sessions
            .find_session(conversation_id, recipient_device_id, own_device_id)
            .await?
        {
            if let Some(state) = self.try_load_local(&row.id).await? {
                return Ok(ActiveSession {
                    session_id: row.id,
                    state,
                });
            }
        }

        self.initialize_new_session(
            conversation_id,
            recipient_user_id,
            own_device_id,
            recipient_device_id,
        )
        .await
    }

    async fn initialize_new_session(
        &self,
        conversation_id: &str,
        recipient_user_id: &str,
        own_device_id: &str,
        recipient_device_id: &str,
    ) -> Result<ActiveSession, SessionError> {
        let identity = self.registry.identity_key_pair().await?;
        let ephemeral = DhKeyPair::generate();
        let bundle = self
            .registry
            .fetch_recipient_bundle(recipient_user_id)
            .await?;

        let shared_secret = x3dh_initiator(&identity, &ephemeral, &bundle)?;
        let state = initialize_session(&shared_secret, DhKeyPair::generate(), &bundle.signed_prekey)?;

        let record = self
            .sessions
            .insert_session(NewSession {
                conversation_id: conversation_id.to_string(),
                sender_device_id: own_device_id.to_string(),
                receiver_device_id: recipient_device_id.to_string(),
                state: state::patch_from_state(&state),
                handshake_identity_key: Some(codec::encode_public_key(
                    identity.public_key().as_bytes(),
                )),
                handshake_ephemeral_key: Some(codec::encode_public_key(
                    ephemeral.public().as_bytes(),
                )),
                handshake_one_time_prekey: bundle
                    .one_time_prekey
                    .as_ref()
                    .map(|k| codec::encode_public_key(k.as_bytes())),
            })
            .await?;

        self.save_session_state(&record.id, &state).await?;

        info!(
            session_id = %record.id,
            conversation_id,
            recipient_device_id,
            "initialized outbound session"
        );

        Ok(ActiveSession {
            session_id: record.id,
            state,
        })
    }

    /// Load a session's ratchet state: vault cache first, else the remote row
    /// joined with the locally held dh-send key pair.
    pub async fn load_session_state(&self, session_id: &str) -> Result<RatchetState, SessionError> {
        self.try_load_local(session_id)
            .await?
            .ok_or_else(|| SessionError::SendKeyUnavailable {
                session_id: session_id.to_string(),
            })
    }

    async fn try_load_local(
        &self,
        session_id: &str,
    ) -> Result<Option<RatchetState>, SessionError> {
        if let Some(json) = self.vault.get(&session_cache_key(session_id)).await? {
            return Ok(Some(StoredRatchetState::from_json(&json)?.into_state()?));
        }

        // Cold cache: the remote row has every public field, the private
        // dh-send half only ever exists in the vault
        let Some(blob) = self.vault.get(&session_dh_key(session_id)).await? else {
            return Ok(None);
        };
        let dh_send = DhKeyPair::from_base64(&blob)?;

        let row = self.sessions.session_by_id(session_id).await?;
        let state = state::state_from_row_fields(
            &row.root_key,
            &row.chain_key_send,
            &row.chain_key_receive,
            dh_send,
            &row.dh_receive,
            row.send_counter,
            row.receive_counter,
            row.previous_counter,
        )?;

        self.vault
            .set(
                &session_cache_key(session_id),
                &StoredRatchetState::from_state(&state).to_json()?,
            )
            .await?;

        Ok(Some(state))
    }

    /// Write-through save: vault cache, vault dh-send blob, then the remote
    /// row (public fields only, `updated_at` stamped by the store).
    pub async fn save_session_state(
        &self,
        session_id: &str,
        state: &RatchetState,
    ) -> Result<(), SessionError> {
        let snapshot = StoredRatchetState::from_state(state);
        self.vault
            .set(&session_cache_key(session_id), &snapshot.to_json()?)
            .await?;
        self.vault
            .set(&session_dh_key(session_id), &snapshot.dh_send)
            .await?;

        self.sessions
            .update_session(session_id, state::patch_from_state(state))
            .await?;

        Ok(())
    }

    /// Encrypt one message to a user, creating the session on first use.
    pub async fn encrypt_message(
        &self,
        conversation_id: &str,
        recipient_user_id: &str,
        plaintext: &str,
    ) -> Result<OutboundMessage, SessionError> {
        let own_device = self.registry.device_id().await?;
        let recipient_device = self.registry.latest_device(recipient_user_id).await?;

        let _guard = self
            .lock_for(&lock_key(conversation_id, &own_device, &recipient_device.id))
            .await;

        let active = self
            .get_or_create_locked(
                conversation_id,
                recipient_user_id,
                &own_device,
                &recipient_device.id,
            )
            .await?;

        let (message, new_state) = active.state.encrypt(plaintext.as_bytes())?;

        // Until the peer speaks, every message repeats the handshake so the
        // responder can establish its side from any of them
        let handshake = if active.state.awaiting_first_reply() {
            let row = self.sessions.session_by_id(&active.session_id).await?;
            match (row.handshake_identity_key, row.handshake_ephemeral_key) {
                (Some(identity_key), Some(ephemeral_key)) => Some(HandshakeHeader {
                    identity_key,
                    ephemeral_key,
                    one_time_prekey: row.handshake_one_time_prekey,
                }),
                _ => None,
            }
        } else {
            None
        };

        self.save_session_state(&active.session_id, &new_state).await?;

        Ok(OutboundMessage {
            message,
            handshake,
            sender_device_id: own_device,
        })
    }

    /// Decrypt one message from a user, bootstrapping the responder side of
    /// the session from the handshake header on first contact.
    pub async fn decrypt_message(
        &self,
        conversation_id: &str,
        sender_user_id: &str,
        message: &EncryptedMessage,
        handshake: Option<&HandshakeHeader>,
    ) -> Result<String, SessionError> {
        let own_device = self.registry.device_id().await?;
        let sender_device = self.registry.latest_device(sender_user_id).await?;

        let _guard = self
            .lock_for(&lock_key(conversation_id, &sender_device.id, &own_device))
            .await;

        let forward = self
            .sessions
            .find_session(conversation_id, &sender_device.id, &own_device)
            .await?;

        let mut loaded = None;
        if let Some(row) = &forward {
            if let Some(state) = self.try_load_local(&row.id).await? {
                loaded = Some(ActiveSession {
                    session_id: row.id.clone(),
                    state,
                });
            }
        }

        // The session this device initiated carries the peer's replies too
        if loaded.is_none() {
            if let Some(row) = self
                .sessions
                .find_session(conversation_id, &own_device, &sender_device.id)
                .await?
            {
                if let Some(state) = self.try_load_local(&row.id).await? {
                    loaded = Some(ActiveSession {
                        session_id: row.id,
                        state,
                    });
                }
            }
        }

        let active = match loaded {
            Some(active) => active,
            // No local material anywhere: first contact. Reuse the
            // initiator's row when it is already visible remotely.
            None => {
                self.bootstrap_responder(
                    conversation_id,
                    &sender_device.id,
                    &own_device,
                    forward.map(|row| row.id),
                    handshake,
                )
                .await?
            }
        };

        let (plaintext, new_state) = active.state.decrypt(message)?;
        self.save_session_state(&active.session_id, &new_state).await?;

        String::from_utf8(plaintext).map_err(|_| SessionError::MalformedPlaintext)
    }

    async fn bootstrap_responder(
        &self,
        conversation_id: &str,
        sender_device_id: &str,
        own_device_id: &str,
        existing_row: Option<String>,
        handshake: Option<&HandshakeHeader>,
    ) -> Result<ActiveSession, SessionError> {
        let header = handshake.ok_or_else(|| SessionError::NoSessionFound {
            conversation_id: conversation_id.to_string(),
        })?;

        info!(
            conversation_id,
            sender_device_id, "establishing responder session from first message"
        );

        let identity = self.registry.identity_key_pair().await?;
        let signed_prekey = self.registry.signed_prekey(own_device_id).await?;
        let initiator_identity = state::public_key_from_b64(&header.identity_key)?;
        let initiator_ephemeral = state::public_key_from_b64(&header.ephemeral_key)?;

        let one_time_prekey = match &header.one_time_prekey {
            Some(encoded) => {
                let public = state::public_key_from_b64(encoded)?;
                let found = self
                    .registry
                    .find_one_time_prekey(own_device_id, &public)
                    .await?;
                let Some((index, _)) = found else {
                    return Err(SessionError::UnknownOneTimePreKey);
                };
                let consumed = self
                    .registry
                    .consume_one_time_prekey(own_device_id, index)
                    .await?;
                Some(consumed.ok_or(SessionError::UnknownOneTimePreKey)?)
            }
            None => None,
        };

        let shared_secret = x3dh_responder(
            &identity,
            &signed_prekey,
            one_time_prekey.as_ref(),
            &initiator_identity,
            &initiator_ephemeral,
        )?;
        let state = accept_first_message(&shared_secret, signed_prekey)?;

        let session_id = match existing_row {
            Some(session_id) => {
                self.sessions
                    .update_session(&session_id, state::patch_from_state(&state))
                    .await?;
                session_id
            }
            None => {
                self.sessions
                    .insert_session(NewSession {
                        conversation_id: conversation_id.to_string(),
                        sender_device_id: sender_device_id.to_string(),
                        receiver_device_id: own_device_id.to_string(),
                        state: state::patch_from_state(&state),
                        handshake_identity_key: None,
                        handshake_ephemeral_key: None,
                        handshake_one_time_prekey: None,
                    })
                    .await?
                    .id
            }
        };

        self.save_session_state(&session_id, &state).await?;

        Ok(ActiveSession { session_id, state })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessagingConfig;
    use crate::store::{MemoryDirectory, MemoryVault};

    struct Device {
        store: SessionStore,
        vault: Arc<MemoryVault>,
    }

    async fn device(directory: &Arc<MemoryDirectory>, user_id: &str) -> Device {
        let vault = Arc::new(MemoryVault::new());
        let config = MessagingConfig {
            one_time_prekey_count: 4,
            ..MessagingConfig::default()
        };
        let registry = Arc::new(DeviceRegistry::new(directory.clone(), vault.clone(), &config));
        registry.initialize(user_id).await.unwrap();

        Device {
            store: SessionStore::new(registry, directory.clone(), vault.clone()),
            vault,
        }
    }

    #[tokio::test]
    async fn test_first_exchange_establishes_both_sides() {
        let directory = Arc::new(MemoryDirectory::new());
        let alice = device(&directory, "alice").await;
        let bob = device(&directory, "bob").await;

        let out = alice
            .store
            .encrypt_message("conv-1", "bob", "hello")
            .await
            .unwrap();
        assert_eq!(out.message.message_number, 0);
        assert!(out.handshake.is_some());

        let plaintext = bob
            .store
            .decrypt_message("conv-1", "alice", &out.message, out.handshake.as_ref())
            .await
            .unwrap();
        assert_eq!(plaintext, "hello");
    }

    #[tokio::test]
    async fn test_handshake_stops_after_first_reply() {
        let directory = Arc::new(MemoryDirectory::new());
        let alice = device(&directory, "alice").await;
        let bob = device(&directory, "bob").await;

        let out = alice
            .store
            .encrypt_message("conv-1", "bob", "hello")
            .await
            .unwrap();
        bob.store
            .decrypt_message("conv-1", "alice", &out.message, out.handshake.as_ref())
            .await
            .unwrap();

        let reply = bob
            .store
            .encrypt_message("conv-1", "alice", "hi")
            .await
            .unwrap();
        alice
            .store
            .decrypt_message("conv-1", "bob", &reply.message, reply.handshake.as_ref())
            .await
            .unwrap();

        // Alice has heard from Bob; no more handshake metadata
        let next = alice
            .store
            .encrypt_message("conv-1", "bob", "how are you")
            .await
            .unwrap();
        assert!(next.handshake.is_none());
    }

    #[tokio::test]
    async fn test_session_reused_and_cached() {
        let directory = Arc::new(MemoryDirectory::new());
        let alice = device(&directory, "alice").await;
        let _bob = device(&directory, "bob").await;

        let first = alice
            .store
            .get_or_create_session("conv-1", "bob")
            .await
            .unwrap();
        let second = alice
            .store
            .get_or_create_session("conv-1", "bob")
            .await
            .unwrap();
        assert_eq!(first.session_id, second.session_id);

        let cached = alice
            .vault
            .get(&session_cache_key(&first.session_id))
            .await
            .unwrap();
        assert!(cached.is_some());
    }

    #[tokio::test]
    async fn test_cold_cache_recovers_from_row_and_dh_blob() {
        let directory = Arc::new(MemoryDirectory::new());
        let alice = device(&directory, "alice").await;
        let _bob = device(&directory, "bob").await;

        let session = alice
            .store
            .get_or_create_session("conv-1", "bob")
            .await
            .unwrap();

        // Drop the cache entry but keep the dh-send blob
        alice
            .vault
            .remove(&session_cache_key(&session.session_id))
            .await
            .unwrap();

        let state = alice
            .store
            .load_session_state(&session.session_id)
            .await
            .unwrap();
        assert_eq!(state.send_counter, session.state.send_counter);

        // Without the dh-send blob the session is unusable on this device
        alice
            .vault
            .remove(&session_cache_key(&session.session_id))
            .await
            .unwrap();
        alice
            .vault
            .remove(&session_dh_key(&session.session_id))
            .await
            .unwrap();
        assert!(matches!(
            alice.store.load_session_state(&session.session_id).await,
            Err(SessionError::SendKeyUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_decrypt_without_session_or_handshake_fails() {
        let directory = Arc::new(MemoryDirectory::new());
        let alice = device(&directory, "alice").await;
        let bob = device(&directory, "bob").await;

        let out = alice
            .store
            .encrypt_message("conv-1", "bob", "hello")
            .await
            .unwrap();

        let result = bob
            .store
            .decrypt_message("conv-1", "alice", &out.message, None)
            .await;
        assert!(matches!(result, Err(SessionError::NoSessionFound { .. })));
    }

    #[tokio::test]
    async fn test_replayed_message_rejected() {
        let directory = Arc::new(MemoryDirectory::new());
        let alice = device(&directory, "alice").await;
        let bob = device(&directory, "bob").await;

        let m0 = alice
            .store
            .encrypt_message("conv-1", "bob", "zero")
            .await
            .unwrap();
        let m1 = alice
            .store
            .encrypt_message("conv-1", "bob", "one")
            .await
            .unwrap();

        bob.store
            .decrypt_message("conv-1", "alice", &m0.message, m0.handshake.as_ref())
            .await
            .unwrap();
        bob.store
            .decrypt_message("conv-1", "alice", &m1.message, m1.handshake.as_ref())
            .await
            .unwrap();

        let replay = bob
            .store
            .decrypt_message("conv-1", "alice", &m0.message, m0.handshake.as_ref())
            .await;
        assert!(matches!(
            replay,
            Err(SessionError::Ratchet(RatchetError::CounterReplayed { .. }))
        ));
    }
}
