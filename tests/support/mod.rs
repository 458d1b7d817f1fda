// Shared integration-test setup.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a `tracing` subscriber once per test binary so `debug!`/`warn!` output from the
/// acquisition engine and heartbeat task is visible with `--nocapture`. Safe to call from every
/// test; only the first call takes effect.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
