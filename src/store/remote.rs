//! Remote row store interfaces
//!
//! Device and session records live in a remote relational store reached over
//! the network. The traits here are the whole surface the core needs:
//! equality/ordering lookups with `maybe-single` (Option) or `single`
//! (error on miss) cardinality, inserts returning the stored row, and
//! field-level updates. All key fields are base64; private halves are never
//! part of a row.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// A registered device of some user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub user_id: String,
    pub device_name: String,
    /// X25519 identity public key
    pub identity_key: String,
    /// Ed25519 identity verifying key
    pub identity_signing_key: String,
    pub signed_prekey: String,
    pub prekey_signature: String,
    /// Ordered pool of unconsumed one-time prekey publics
    pub one_time_prekeys: Vec<String>,
    /// Unix milliseconds
    pub last_active: u64,
}

/// Fields for registering a device; the store assigns id and `last_active`.
#[derive(Debug, Clone)]
pub struct NewDevice {
    pub user_id: String,
    pub device_name: String,
    pub identity_key: String,
    pub identity_signing_key: String,
    pub signed_prekey: String,
    pub prekey_signature: String,
    pub one_time_prekeys: Vec<String>,
}

/// Persisted ratchet session for one (conversation, device pair).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub conversation_id: String,
    pub sender_device_id: String,
    pub receiver_device_id: String,
    pub root_key: String,
    pub chain_key_send: String,
    pub chain_key_receive: String,
    pub send_counter: u32,
    pub receive_counter: u32,
    pub previous_counter: u32,
    pub dh_send_public: String,
    pub dh_receive: String,
    /// Handshake echo for the responder bootstrap; cleared of meaning once
    /// the peer has replied.
    pub handshake_identity_key: Option<String>,
    pub handshake_ephemeral_key: Option<String>,
    pub handshake_one_time_prekey: Option<String>,
    /// Unix milliseconds
    pub updated_at: u64,
}

/// Fields for creating a session row; the store assigns id and `updated_at`.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub conversation_id: String,
    pub sender_device_id: String,
    pub receiver_device_id: String,
    pub state: SessionPatch,
    pub handshake_identity_key: Option<String>,
    pub handshake_ephemeral_key: Option<String>,
    pub handshake_one_time_prekey: Option<String>,
}

/// The mutable ratchet fields of a session row (public halves only).
#[derive(Debug, Clone)]
pub struct SessionPatch {
    pub root_key: String,
    pub chain_key_send: String,
    pub chain_key_receive: String,
    pub send_counter: u32,
    pub receive_counter: u32,
    pub previous_counter: u32,
    pub dh_send_public: String,
    pub dh_receive: String,
}

/// Remote device records.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Insert a device row, returning it with its assigned id.
    async fn insert_device(&self, device: NewDevice) -> Result<DeviceRecord, StoreError>;

    /// The most-recently-active device of a user, if any (maybe-single).
    async fn latest_device_for_user(
        &self,
        user_id: &str,
    ) -> Result<Option<DeviceRecord>, StoreError>;

    /// Fetch a device by id (maybe-single).
    async fn device_by_id(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError>;

    /// Replace a device's one-time prekey pool.
    async fn update_one_time_prekeys(
        &self,
        device_id: &str,
        one_time_prekeys: Vec<String>,
    ) -> Result<(), StoreError>;

    /// Stamp a device's `last_active` with the current time.
    async fn touch_device(&self, device_id: &str) -> Result<(), StoreError>;
}

/// Remote session records.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    /// Insert a session row, returning it with its assigned id.
    async fn insert_session(&self, session: NewSession) -> Result<SessionRecord, StoreError>;

    /// Look up the session for a (conversation, sender device, receiver
    /// device) triple (maybe-single).
    async fn find_session(
        &self,
        conversation_id: &str,
        sender_device_id: &str,
        receiver_device_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// Fetch a session by id (single: missing rows are an error).
    async fn session_by_id(&self, session_id: &str) -> Result<SessionRecord, StoreError>;

    /// Write back the ratchet fields of a session, stamping `updated_at`.
    async fn update_session(
        &self,
        session_id: &str,
        patch: SessionPatch,
    ) -> Result<(), StoreError>;
}
