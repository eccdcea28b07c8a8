use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `filter` uses `RUST_LOG` syntax; an unparsable
/// filter falls back to `info`. Safe to call more than once (later calls are no-ops).
pub fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}
