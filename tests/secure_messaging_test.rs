//! End-to-end tests over the in-memory stores
//!
//! Two simulated devices share one remote directory; each holds its own
//! vault. Everything below exercises the public facade the way an embedding
//! application would.

use std::sync::Arc;

use async_trait::async_trait;
use defcom_core::store::{DeviceRecord, NewDevice};
use defcom_core::{
    DecryptOutcome, DeviceDirectory, DeviceRegistry, MemoryDirectory, MemoryVault,
    MessageEnvelope, MessagingConfig, PlaintextSource, Readiness, SecureMessaging, SessionStore,
    StoreError,
};

struct TestDevice {
    facade: SecureMessaging,
}

async fn test_device(
    directory: &Arc<MemoryDirectory>,
    config: &MessagingConfig,
    user_id: &str,
) -> TestDevice {
    let vault = Arc::new(MemoryVault::new());
    let registry = Arc::new(DeviceRegistry::new(directory.clone(), vault.clone(), config));
    let sessions = Arc::new(SessionStore::new(
        registry.clone(),
        directory.clone(),
        vault.clone(),
    ));

    TestDevice {
        facade: SecureMessaging::initialize(registry, sessions, config, user_id).await,
    }
}

fn small_config() -> MessagingConfig {
    MessagingConfig {
        one_time_prekey_count: 4,
        ..MessagingConfig::default()
    }
}

#[tokio::test]
async fn test_alice_and_bob_exchange_messages() {
    let directory = Arc::new(MemoryDirectory::new());
    let config = small_config();

    let alice = test_device(&directory, &config, "alice").await;
    let bob = test_device(&directory, &config, "bob").await;
    assert!(alice.facade.is_ready());
    assert!(bob.facade.is_ready());

    // Alice opens the conversation
    let envelope = alice.facade.encrypt("conv-1", "bob", "hello").await;
    assert!(envelope.encrypted);
    assert_eq!(envelope.message_number, Some(0));
    assert!(envelope.ratchet_key.is_some());
    assert!(envelope.sender_device_id.is_some());
    assert!(envelope.handshake.is_some());

    // Bob's first decrypt bootstraps his side of the session
    let outcome = bob.facade.decrypt("conv-1", "alice", &envelope).await;
    assert_eq!(
        outcome,
        DecryptOutcome::Decrypted {
            text: "hello".to_string(),
            source: PlaintextSource::Ratchet,
        }
    );

    // Bob replies; Alice's decrypt runs her first DH ratchet step
    let reply = bob.facade.encrypt("conv-1", "alice", "hi").await;
    assert!(reply.ratchet_key.is_some());
    assert_ne!(reply.ratchet_key, envelope.ratchet_key);

    let outcome = alice.facade.decrypt("conv-1", "bob", &reply).await;
    assert_eq!(outcome.text(), Some("hi"));
}

#[tokio::test]
async fn test_long_conversation_stays_in_sync() {
    let directory = Arc::new(MemoryDirectory::new());
    let config = small_config();

    let alice = test_device(&directory, &config, "alice").await;
    let bob = test_device(&directory, &config, "bob").await;

    for i in 0..8u32 {
        let text = format!("alice says {i}");
        let envelope = alice.facade.encrypt("conv-1", "bob", &text).await;
        let outcome = bob.facade.decrypt("conv-1", "alice", &envelope).await;
        assert_eq!(outcome.text(), Some(text.as_str()));

        let text = format!("bob says {i}");
        let envelope = bob.facade.encrypt("conv-1", "alice", &text).await;
        let outcome = alice.facade.decrypt("conv-1", "bob", &envelope).await;
        assert_eq!(outcome.text(), Some(text.as_str()));
    }
}

#[tokio::test]
async fn test_conversations_are_isolated_sessions() {
    let directory = Arc::new(MemoryDirectory::new());
    let config = small_config();

    let alice = test_device(&directory, &config, "alice").await;
    let bob = test_device(&directory, &config, "bob").await;

    let one = alice.facade.encrypt("conv-1", "bob", "in one").await;
    let two = alice.facade.encrypt("conv-2", "bob", "in two").await;

    // Separate sessions both start their chains at zero
    assert_eq!(one.message_number, Some(0));
    assert_eq!(two.message_number, Some(0));
    assert_ne!(one.ciphertext, two.ciphertext);

    assert_eq!(
        bob.facade.decrypt("conv-2", "alice", &two).await.text(),
        Some("in two")
    );
    assert_eq!(
        bob.facade.decrypt("conv-1", "alice", &one).await.text(),
        Some("in one")
    );
}

#[tokio::test]
async fn test_exhausted_one_time_prekeys_still_connect() {
    let directory = Arc::new(MemoryDirectory::new());
    let config = MessagingConfig {
        one_time_prekey_count: 0,
        ..MessagingConfig::default()
    };

    let alice = test_device(&directory, &config, "alice").await;
    let bob = test_device(&directory, &config, "bob").await;

    let envelope = alice.facade.encrypt("conv-1", "bob", "no prekeys left").await;
    assert!(envelope.handshake.is_some());
    assert!(envelope.handshake.as_ref().unwrap().one_time_prekey.is_none());

    let outcome = bob.facade.decrypt("conv-1", "alice", &envelope).await;
    assert_eq!(outcome.text(), Some("no prekeys left"));
}

#[tokio::test]
async fn test_fallback_envelope_roundtrip() {
    let directory = Arc::new(MemoryDirectory::new());
    let config = small_config();

    let bob = test_device(&directory, &config, "bob").await;

    // An envelope without ratchet metadata always routes to the fallback
    // cipher, which shares one deployment-wide secret
    let cipher = defcom_core::FallbackCipher::new(&config.fallback_secret);
    let envelope = MessageEnvelope {
        ciphertext: cipher.encrypt("legacy message").unwrap(),
        encrypted: true,
        ratchet_key: None,
        message_number: None,
        previous_counter: None,
        sender_device_id: None,
        handshake: None,
    };

    let outcome = bob.facade.decrypt("conv-1", "alice", &envelope).await;
    assert_eq!(
        outcome,
        DecryptOutcome::Decrypted {
            text: "legacy message".to_string(),
            source: PlaintextSource::Fallback,
        }
    );
}

#[tokio::test]
async fn test_undecryptable_envelope_fails_explicitly() {
    let directory = Arc::new(MemoryDirectory::new());
    let config = small_config();
    let bob = test_device(&directory, &config, "bob").await;

    let envelope = MessageEnvelope {
        ciphertext: "bm90IGEgcmVhbCBjaXBoZXJ0ZXh0IGF0IGFsbCwgc29ycnk=".to_string(),
        encrypted: true,
        ratchet_key: None,
        message_number: None,
        previous_counter: None,
        sender_device_id: None,
        handshake: None,
    };

    let outcome = bob.facade.decrypt("conv-1", "alice", &envelope).await;
    assert!(matches!(outcome, DecryptOutcome::Failed { .. }));
}

/// A directory whose every call fails, simulating an unreachable remote
/// store.
struct UnreachableDirectory;

#[async_trait]
impl DeviceDirectory for UnreachableDirectory {
    async fn insert_device(&self, _device: NewDevice) -> Result<DeviceRecord, StoreError> {
        Err(StoreError::Backend("network unreachable".to_string()))
    }

    async fn latest_device_for_user(
        &self,
        _user_id: &str,
    ) -> Result<Option<DeviceRecord>, StoreError> {
        Err(StoreError::Backend("network unreachable".to_string()))
    }

    async fn device_by_id(&self, _device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        Err(StoreError::Backend("network unreachable".to_string()))
    }

    async fn update_one_time_prekeys(
        &self,
        _device_id: &str,
        _one_time_prekeys: Vec<String>,
    ) -> Result<(), StoreError> {
        Err(StoreError::Backend("network unreachable".to_string()))
    }

    async fn touch_device(&self, _device_id: &str) -> Result<(), StoreError> {
        Err(StoreError::Backend("network unreachable".to_string()))
    }
}

#[tokio::test]
async fn test_degraded_facade_uses_fallback_both_ways() {
    let config = small_config();

    // Registration cannot reach the remote store, so the facade comes up
    // degraded instead of failing
    let broken = Arc::new(UnreachableDirectory);
    let sessions_directory = Arc::new(MemoryDirectory::new());
    let vault = Arc::new(MemoryVault::new());
    let registry = Arc::new(DeviceRegistry::new(broken, vault.clone(), &config));
    let sessions = Arc::new(SessionStore::new(
        registry.clone(),
        sessions_directory,
        vault,
    ));

    let facade = SecureMessaging::initialize(registry, sessions, &config, "alice").await;
    assert!(!facade.is_ready());
    assert!(matches!(facade.readiness(), Readiness::Degraded { .. }));

    let envelope = facade.encrypt("conv-1", "bob", "still deliverable").await;
    assert!(envelope.encrypted);
    assert!(envelope.ratchet_key.is_none());

    // Any same-secret deployment member can read the fallback envelope
    let directory = Arc::new(MemoryDirectory::new());
    let healthy = test_device(&directory, &config, "carol").await;
    let outcome = healthy.facade.decrypt("conv-1", "alice", &envelope).await;
    assert_eq!(
        outcome,
        DecryptOutcome::Decrypted {
            text: "still deliverable".to_string(),
            source: PlaintextSource::Fallback,
        }
    );
}

#[tokio::test]
async fn test_replayed_envelope_rejected_end_to_end() {
    let directory = Arc::new(MemoryDirectory::new());
    let config = small_config();

    let alice = test_device(&directory, &config, "alice").await;
    let bob = test_device(&directory, &config, "bob").await;

    let e0 = alice.facade.encrypt("conv-1", "bob", "zero").await;
    let e1 = alice.facade.encrypt("conv-1", "bob", "one").await;

    assert_eq!(bob.facade.decrypt("conv-1", "alice", &e0).await.text(), Some("zero"));
    assert_eq!(bob.facade.decrypt("conv-1", "alice", &e1).await.text(), Some("one"));

    // A replay is refused by the ratchet and cannot be salvaged by the
    // fallback cipher either
    let outcome = bob.facade.decrypt("conv-1", "alice", &e0).await;
    assert!(matches!(outcome, DecryptOutcome::Failed { .. }));
}

#[tokio::test]
async fn test_concurrent_sends_serialize_per_session() {
    let directory = Arc::new(MemoryDirectory::new());
    let config = small_config();

    let alice = Arc::new(test_device(&directory, &config, "alice").await);
    let bob = test_device(&directory, &config, "bob").await;

    let mut handles = Vec::new();
    for i in 0..6u32 {
        let alice = alice.clone();
        handles.push(tokio::spawn(async move {
            alice
                .facade
                .encrypt("conv-1", "bob", &format!("burst {i}"))
                .await
        }));
    }

    let mut envelopes = Vec::new();
    for handle in handles {
        envelopes.push(handle.await.unwrap());
    }

    // Per-session locking hands out each chain position exactly once
    let mut numbers: Vec<u32> = envelopes
        .iter()
        .map(|e| e.message_number.unwrap())
        .collect();
    numbers.sort_unstable();
    assert_eq!(numbers, vec![0, 1, 2, 3, 4, 5]);

    // And the receiver can decrypt the burst in chain order
    let mut by_number = envelopes;
    by_number.sort_by_key(|e| e.message_number.unwrap());
    for envelope in &by_number {
        assert!(bob
            .facade
            .decrypt("conv-1", "alice", envelope)
            .await
            .text()
            .is_some());
    }
}
