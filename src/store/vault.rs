//! Local secret vault
//!
//! A scoped key-value store for private key material and cached session
//! state. Contents never leave the device; the remote rows only ever see
//! public halves.

use async_trait::async_trait;

use crate::store::StoreError;

/// Device-local key-value secret storage.
#[async_trait]
pub trait KeyVault: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}
