use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT_TRACING: Once = Once::new();

/// Install a test-friendly subscriber once per process. `RUST_LOG`
/// overrides the default filter.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn,tandem_engine=info"));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_test_writer()
            .compact()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
