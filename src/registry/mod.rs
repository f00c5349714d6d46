//! Device registry
//!
//! Owns this device's identity key pair and prekey material. Registration
//! publishes the public halves as a device row; every private half stays in
//! the local vault, keyed by device id (plus index for one-time prekeys).

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::config::MessagingConfig;
use crate::crypto::codec::{self, CodecError};
use crate::crypto::keys::{DhKeyPair, IdentityKeyPair, KeyError, PreKeyBundle};
use crate::store::{DeviceDirectory, DeviceRecord, KeyVault, NewDevice, StoreError};

const DEVICE_ID_KEY: &str = "device_id";
const IDENTITY_KEYPAIR_KEY: &str = "identity_keypair";

fn signed_prekey_key(device_id: &str) -> String {
    format!("signed_prekey_{device_id}")
}

fn one_time_prekey_key(device_id: &str, index: usize) -> String {
    format!("one_time_prekey_{device_id}_{index}")
}

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("device not initialized")]
    NotInitialized,
    #[error("no registered device for user {user_id}")]
    NoDeviceFound { user_id: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Default)]
struct RegistryCache {
    device_id: Option<String>,
    identity: Option<IdentityKeyPair>,
}

/// This device's identity and prekey material.
pub struct DeviceRegistry {
    directory: Arc<dyn DeviceDirectory>,
    vault: Arc<dyn KeyVault>,
    device_name: String,
    one_time_prekey_count: usize,
    cache: RwLock<RegistryCache>,
}

impl DeviceRegistry {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        vault: Arc<dyn KeyVault>,
        config: &MessagingConfig,
    ) -> Self {
        Self {
            directory,
            vault,
            device_name: config.device_name.clone(),
            one_time_prekey_count: config.one_time_prekey_count,
            cache: RwLock::new(RegistryCache::default()),
        }
    }

    /// Idempotent setup: load-or-generate the identity, load-or-register the
    /// device, stamp `last_active`. Returns the device id.
    pub async fn initialize(&self, user_id: &str) -> Result<String, RegistryError> {
        let identity = match self.vault.get(IDENTITY_KEYPAIR_KEY).await? {
            Some(blob) => IdentityKeyPair::from_base64(&blob)?,
            None => {
                let identity = IdentityKeyPair::generate();
                self.vault
                    .set(IDENTITY_KEYPAIR_KEY, &identity.to_base64())
                    .await?;
                info!("generated new identity key pair");
                identity
            }
        };

        let device_id = match self.vault.get(DEVICE_ID_KEY).await? {
            Some(device_id) => device_id,
            None => {
                let record = self.register_device(user_id, &identity).await?;
                info!(device_id = %record.id, user_id, "registered device");
                record.id
            }
        };

        {
            let mut cache = self.cache.write().await;
            cache.device_id = Some(device_id.clone());
            cache.identity = Some(identity);
        }

        self.directory.touch_device(&device_id).await?;

        Ok(device_id)
    }

    async fn register_device(
        &self,
        user_id: &str,
        identity: &IdentityKeyPair,
    ) -> Result<DeviceRecord, RegistryError> {
        let signed_prekey = DhKeyPair::generate();
        let signature = identity.sign(signed_prekey.public().as_bytes());

        let one_time_prekeys: Vec<DhKeyPair> = (0..self.one_time_prekey_count)
            .map(|_| DhKeyPair::generate())
            .collect();

        let record = self
            .directory
            .insert_device(NewDevice {
                user_id: user_id.to_string(),
                device_name: self.device_name.clone(),
                identity_key: codec::encode_public_key(identity.public_key().as_bytes()),
                identity_signing_key: codec::encode_public_key(
                    identity.verifying_key().as_bytes(),
                ),
                signed_prekey: codec::encode_public_key(signed_prekey.public().as_bytes()),
                prekey_signature: codec::encode_bytes(&signature.to_bytes()),
                one_time_prekeys: one_time_prekeys
                    .iter()
                    .map(|k| codec::encode_public_key(k.public().as_bytes()))
                    .collect(),
            })
            .await?;

        self.vault
            .set(&signed_prekey_key(&record.id), &signed_prekey.to_base64())
            .await?;
        for (index, key) in one_time_prekeys.iter().enumerate() {
            self.vault
                .set(&one_time_prekey_key(&record.id, index), &key.to_base64())
                .await?;
        }
        self.vault.set(DEVICE_ID_KEY, &record.id).await?;

        Ok(record)
    }

    /// This device's identity key pair: cache, else vault.
    pub async fn identity_key_pair(&self) -> Result<IdentityKeyPair, RegistryError> {
        if let Some(identity) = self.cache.read().await.identity.clone() {
            return Ok(identity);
        }

        let blob = self
            .vault
            .get(IDENTITY_KEYPAIR_KEY)
            .await?
            .ok_or(RegistryError::NotInitialized)?;
        let identity = IdentityKeyPair::from_base64(&blob)?;
        self.cache.write().await.identity = Some(identity.clone());
        Ok(identity)
    }

    /// This device's id: cache, else vault.
    pub async fn device_id(&self) -> Result<String, RegistryError> {
        if let Some(device_id) = self.cache.read().await.device_id.clone() {
            return Ok(device_id);
        }

        let device_id = self
            .vault
            .get(DEVICE_ID_KEY)
            .await?
            .ok_or(RegistryError::NotInitialized)?;
        self.cache.write().await.device_id = Some(device_id.clone());
        Ok(device_id)
    }

    /// The most-recently-active device record of a user.
    pub async fn latest_device(&self, user_id: &str) -> Result<DeviceRecord, RegistryError> {
        self.directory
            .latest_device_for_user(user_id)
            .await?
            .ok_or_else(|| RegistryError::NoDeviceFound {
                user_id: user_id.to_string(),
            })
    }

    /// Fetch a peer's prekey bundle, consuming the first one-time prekey of
    /// the pool (FIFO) as a side effect.
    pub async fn fetch_recipient_bundle(
        &self,
        user_id: &str,
    ) -> Result<PreKeyBundle, RegistryError> {
        let device = self.latest_device(user_id).await?;

        let one_time_prekey = if device.one_time_prekeys.is_empty() {
            None
        } else {
            let mut remaining = device.one_time_prekeys.clone();
            let consumed = remaining.remove(0);
            self.directory
                .update_one_time_prekeys(&device.id, remaining)
                .await?;
            info!(device_id = %device.id, "consumed one one-time prekey from pool");
            Some(consumed)
        };

        Ok(PreKeyBundle::from_encoded(
            &device.identity_key,
            &device.identity_signing_key,
            &device.signed_prekey,
            &device.prekey_signature,
            one_time_prekey.as_deref(),
        )?)
    }

    /// This device's signed prekey key pair from the vault.
    pub async fn signed_prekey(&self, device_id: &str) -> Result<DhKeyPair, RegistryError> {
        let blob = self
            .vault
            .get(&signed_prekey_key(device_id))
            .await?
            .ok_or(RegistryError::NotInitialized)?;
        Ok(DhKeyPair::from_base64(&blob)?)
    }

    /// Locate a locally stored one-time prekey by its public half.
    ///
    /// Peers identify the consumed key by value; pool positions shift as the
    /// remote list shrinks, so an index from the wire would be meaningless.
    pub async fn find_one_time_prekey(
        &self,
        device_id: &str,
        public: &X25519PublicKey,
    ) -> Result<Option<(usize, DhKeyPair)>, RegistryError> {
        for index in 0..self.one_time_prekey_count {
            let Some(blob) = self.vault.get(&one_time_prekey_key(device_id, index)).await? else {
                continue;
            };
            let pair = DhKeyPair::from_base64(&blob)?;
            if pair.public() == public {
                return Ok(Some((index, pair)));
            }
        }
        Ok(None)
    }

    /// Remove and return the one-time prekey at `index`, deleting it locally
    /// and best-effort removing its public half from the remote pool.
    ///
    /// The remote removal is at-least-once, not transactional with bundle
    /// fetches; a failure is logged and the consumption still succeeds.
    pub async fn consume_one_time_prekey(
        &self,
        device_id: &str,
        index: usize,
    ) -> Result<Option<DhKeyPair>, RegistryError> {
        let Some(blob) = self.vault.get(&one_time_prekey_key(device_id, index)).await? else {
            return Ok(None);
        };
        let pair = DhKeyPair::from_base64(&blob)?;

        self.vault
            .remove(&one_time_prekey_key(device_id, index))
            .await?;

        let public = codec::encode_public_key(pair.public().as_bytes());
        match self.directory.device_by_id(device_id).await {
            Ok(Some(device)) => {
                let remaining: Vec<String> = device
                    .one_time_prekeys
                    .into_iter()
                    .filter(|k| k != &public)
                    .collect();
                if let Err(error) = self
                    .directory
                    .update_one_time_prekeys(&device.id, remaining)
                    .await
                {
                    warn!(%error, device_id, index, "failed to remove one-time prekey remotely");
                }
            }
            Ok(None) => warn!(device_id, "device row missing during one-time prekey removal"),
            Err(error) => {
                warn!(%error, device_id, index, "failed to load device row for prekey removal");
            }
        }

        Ok(Some(pair))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryDirectory, MemoryVault};

    fn registry(directory: &Arc<MemoryDirectory>, count: usize) -> DeviceRegistry {
        let config = MessagingConfig {
            one_time_prekey_count: count,
            ..MessagingConfig::default()
        };
        DeviceRegistry::new(
            directory.clone(),
            Arc::new(MemoryVault::new()),
            &config,
        )
    }

    #[tokio::test]
    async fn test_initialize_registers_once() {
        let directory = Arc::new(MemoryDirectory::new());
        let registry = registry(&directory, 3);

        let first = registry.initialize("alice").await.unwrap();
        let second = registry.initialize("alice").await.unwrap();
        assert_eq!(first, second);

        let device = registry.latest_device("alice").await.unwrap();
        assert_eq!(device.id, first);
        assert_eq!(device.one_time_prekeys.len(), 3);
    }

    #[tokio::test]
    async fn test_uninitialized_accessors_fail() {
        let directory = Arc::new(MemoryDirectory::new());
        let registry = registry(&directory, 3);

        assert!(matches!(
            registry.device_id().await,
            Err(RegistryError::NotInitialized)
        ));
        assert!(matches!(
            registry.identity_key_pair().await,
            Err(RegistryError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_bundle_fetch_pops_prekeys_fifo() {
        let directory = Arc::new(MemoryDirectory::new());
        let bob = registry(&directory, 2);
        bob.initialize("bob").await.unwrap();

        let first_pool = directory
            .latest_device_for_user("bob")
            .await
            .unwrap()
            .unwrap()
            .one_time_prekeys;

        let alice = registry(&directory, 2);
        let bundle = alice.fetch_recipient_bundle("bob").await.unwrap();
        assert_eq!(
            codec::encode_public_key(bundle.one_time_prekey.unwrap().as_bytes()),
            first_pool[0]
        );

        let remaining = directory
            .latest_device_for_user("bob")
            .await
            .unwrap()
            .unwrap()
            .one_time_prekeys;
        assert_eq!(remaining, first_pool[1..].to_vec());
    }

    #[tokio::test]
    async fn test_bundle_fetch_survives_exhausted_pool() {
        let directory = Arc::new(MemoryDirectory::new());
        let bob = registry(&directory, 1);
        bob.initialize("bob").await.unwrap();

        let alice = registry(&directory, 1);
        let first = alice.fetch_recipient_bundle("bob").await.unwrap();
        assert!(first.one_time_prekey.is_some());

        let second = alice.fetch_recipient_bundle("bob").await.unwrap();
        assert!(second.one_time_prekey.is_none());
        assert!(second.verify());
    }

    #[tokio::test]
    async fn test_fetch_for_unknown_user_fails() {
        let directory = Arc::new(MemoryDirectory::new());
        let registry = registry(&directory, 1);

        assert!(matches!(
            registry.fetch_recipient_bundle("nobody").await,
            Err(RegistryError::NoDeviceFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_consume_one_time_prekey_removes_both_halves() {
        let directory = Arc::new(MemoryDirectory::new());
        let bob = registry(&directory, 2);
        let device_id = bob.initialize("bob").await.unwrap();

        let pool = directory
            .device_by_id(&device_id)
            .await
            .unwrap()
            .unwrap()
            .one_time_prekeys;
        let target = X25519PublicKey::from(codec::decode_public_key(&pool[1]).unwrap());

        let (index, pair) = bob
            .find_one_time_prekey(&device_id, &target)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pair.public(), &target);

        let consumed = bob
            .consume_one_time_prekey(&device_id, index)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(consumed.public(), &target);

        // Second consumption finds nothing locally
        assert!(bob
            .consume_one_time_prekey(&device_id, index)
            .await
            .unwrap()
            .is_none());

        // And the public half left the remote pool
        let remaining = directory
            .device_by_id(&device_id)
            .await
            .unwrap()
            .unwrap()
            .one_time_prekeys;
        assert!(!remaining.contains(&pool[1]));
        assert!(remaining.contains(&pool[0]));
    }
}
