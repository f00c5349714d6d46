//! End-to-end encrypted messaging core
//!
//! Provides per-device key generation and registration, X3DH key agreement,
//! double-ratchet message encryption with session persistence, and a
//! deployment-keyed fallback cipher for when the ratchet path is unavailable.
//!
//! The remote row store and the local secret vault are trait seams
//! ([`store::DeviceDirectory`], [`store::SessionDirectory`],
//! [`store::KeyVault`]); [`store::MemoryDirectory`] and
//! [`store::MemoryVault`] back them in-process.

pub mod config;
pub mod crypto;
pub mod facade;
pub mod fallback;
pub mod logger;
pub mod registry;
pub mod session;
pub mod store;

pub use config::MessagingConfig;
pub use crypto::{
    DhKeyPair, EncryptedMessage, HandshakeError, IdentityKeyPair, PreKeyBundle, RatchetError,
    RatchetState, SharedSecret,
};
pub use facade::{DecryptOutcome, MessageEnvelope, PlaintextSource, Readiness, SecureMessaging};
pub use fallback::{FallbackCipher, FallbackOutcome};
pub use logger::init_logger;
pub use registry::{DeviceRegistry, RegistryError};
pub use session::{HandshakeHeader, SessionError, SessionStore};
pub use store::{
    DeviceDirectory, KeyVault, MemoryDirectory, MemoryVault, SessionDirectory, StoreError,
};
