//! In-memory storage implementations
//!
//! Back the collaborator traits with plain maps for tests and single-process
//! embedding. A shared [`MemoryDirectory`] plays the remote store; each
//! simulated device gets its own [`MemoryVault`].

use std::collections::HashMap;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;

use crate::store::remote::{
    DeviceDirectory, DeviceRecord, NewDevice, NewSession, SessionDirectory, SessionPatch,
    SessionRecord,
};
use crate::store::vault::KeyVault;
use crate::store::{now_ms, StoreError};

/// In-memory device and session rows.
#[derive(Default)]
pub struct MemoryDirectory {
    devices: RwLock<HashMap<String, DeviceRecord>>,
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceDirectory for MemoryDirectory {
    async fn insert_device(&self, device: NewDevice) -> Result<DeviceRecord, StoreError> {
        let record = DeviceRecord {
            id: generate_id(),
            user_id: device.user_id,
            device_name: device.device_name,
            identity_key: device.identity_key,
            identity_signing_key: device.identity_signing_key,
            signed_prekey: device.signed_prekey,
            prekey_signature: device.prekey_signature,
            one_time_prekeys: device.one_time_prekeys,
            last_active: now_ms(),
        };
        self.devices
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn latest_device_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<DeviceRecord>, StoreError> {
        let devices = self.devices.read().await;
        Ok(devices
            .values()
            .filter(|d| d.user_id == user_id)
            .max_by(|a, b| {
                a.last_active
                    .cmp(&b.last_active)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned())
    }

    async fn device_by_id(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        Ok(self.devices.read().await.get(device_id).cloned())
    }

    async fn update_one_time_prekeys(
        &self,
        device_id: &str,
        one_time_prekeys: Vec<String>,
    ) -> Result<(), StoreError> {
        let mut devices = self.devices.write().await;
        let device = devices.get_mut(device_id).ok_or(StoreError::RowNotFound)?;
        device.one_time_prekeys = one_time_prekeys;
        Ok(())
    }

    async fn touch_device(&self, device_id: &str) -> Result<(), StoreError> {
        let mut devices = self.devices.write().await;
        let device = devices.get_mut(device_id).ok_or(StoreError::RowNotFound)?;
        device.last_active = now_ms();
        Ok(())
    }
}

#[async_trait]
impl SessionDirectory for MemoryDirectory {
    async fn insert_session(&self, session: NewSession) -> Result<SessionRecord, StoreError> {
        let record = SessionRecord {
            id: generate_id(),
            conversation_id: session.conversation_id,
            sender_device_id: session.sender_device_id,
            receiver_device_id: session.receiver_device_id,
            root_key: session.state.root_key,
            chain_key_send: session.state.chain_key_send,
            chain_key_receive: session.state.chain_key_receive,
            send_counter: session.state.send_counter,
            receive_counter: session.state.receive_counter,
            previous_counter: session.state.previous_counter,
            dh_send_public: session.state.dh_send_public,
            dh_receive: session.state.dh_receive,
            handshake_identity_key: session.handshake_identity_key,
            handshake_ephemeral_key: session.handshake_ephemeral_key,
            handshake_one_time_prekey: session.handshake_one_time_prekey,
            updated_at: now_ms(),
        };
        self.sessions
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn find_session(
        &self,
        conversation_id: &str,
        sender_device_id: &str,
        receiver_device_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .find(|s| {
                s.conversation_id == conversation_id
                    && s.sender_device_id == sender_device_id
                    && s.receiver_device_id == receiver_device_id
            })
            .cloned())
    }

    async fn session_by_id(&self, session_id: &str) -> Result<SessionRecord, StoreError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or(StoreError::RowNotFound)
    }

    async fn update_session(
        &self,
        session_id: &str,
        patch: SessionPatch,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id).ok_or(StoreError::RowNotFound)?;
        session.root_key = patch.root_key;
        session.chain_key_send = patch.chain_key_send;
        session.chain_key_receive = patch.chain_key_receive;
        session.send_counter = patch.send_counter;
        session.receive_counter = patch.receive_counter;
        session.previous_counter = patch.previous_counter;
        session.dh_send_public = patch.dh_send_public;
        session.dh_receive = patch.dh_receive;
        session.updated_at = now_ms();
        Ok(())
    }
}

/// In-memory key-value vault for one device.
#[derive(Default)]
pub struct MemoryVault {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyVault for MemoryVault {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Generate a random row id.
fn generate_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}
