//! Logging setup
//!
//! Installs a process-wide `tracing` subscriber exactly once. Level filtering
//! follows `RUST_LOG`, defaulting to `info` for this crate.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

static INIT: OnceLock<()> = OnceLock::new();

/// Initialize the global tracing subscriber. Safe to call repeatedly; only
/// the first call has any effect, and an already-installed subscriber from
/// the embedding application wins.
pub fn init_logger() {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("defcom_core=info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}
