//! Tracing setup, mirroring the teacher's own `reth-tracing` crate: one real
//! initializer for the binary, one idempotent initializer for tests.

use std::sync::Once;

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Installs a global `tracing` subscriber honoring `RUST_LOG`, defaulting to
/// `info` when unset. Must be called once, near the top of `main`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    // Only fatal if something else already installed a subscriber, which
    // would indicate a programming error in `main`.
    tracing::subscriber::set_global_default(subscriber)
        .expect("autowired_tracing::init must be called at most once");
}

static TEST_INIT: Once = Once::new();

/// Installs a `tracing` subscriber for test binaries. Safe to call from
/// every test: only the first call takes effect.
pub fn init_test_tracing() {
    TEST_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        let _ = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
