//! Messaging configuration

/// Deployment-wide fallback secret used when no value is configured.
///
/// Any deployment that cares about the fallback path should override this
/// via [`MessagingConfig::from_env`] or by setting the field directly.
pub const DEFAULT_FALLBACK_SECRET: &str = "sihbolt-default-secret";

/// Environment variable consulted by [`MessagingConfig::from_env`].
pub const FALLBACK_SECRET_ENV: &str = "DEFCOM_MESSAGE_SECRET";

/// Configuration for the secure messaging core
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    /// Secret keying the fallback cipher. One key for the whole deployment;
    /// strictly weaker than the ratchet path.
    pub fallback_secret: String,

    /// One-time prekeys generated at device registration.
    pub one_time_prekey_count: usize,

    /// Human-readable name published on the device record.
    pub device_name: String,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            fallback_secret: DEFAULT_FALLBACK_SECRET.to_string(),
            one_time_prekey_count: 100,
            device_name: "Mobile Device".to_string(),
        }
    }
}

impl MessagingConfig {
    /// Default configuration with the fallback secret read from the
    /// environment when present.
    pub fn from_env() -> Self {
        Self {
            fallback_secret: std::env::var(FALLBACK_SECRET_ENV)
                .unwrap_or_else(|_| DEFAULT_FALLBACK_SECRET.to_string()),
            ..Self::default()
        }
    }
}
