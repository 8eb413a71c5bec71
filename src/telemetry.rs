use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global tracing subscriber: compact fmt output filtered by
/// `RUST_LOG` (or the given default level). Safe to call once per process.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
