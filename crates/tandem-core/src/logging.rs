//! Tracing subscriber setup shared by the binary and tests.

/// Levels accepted by [`init_subscriber`] and the `TANDEM_LOG_LEVEL` override.
pub const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Normalize a level name, returning `None` for anything unrecognized.
pub fn parse_level(raw: &str) -> Option<&'static str> {
    let lower = raw.trim().to_ascii_lowercase();
    LEVELS.iter().copied().find(|level| *level == lower)
}

/// Initialize the global tracing subscriber with stderr output.
///
/// `RUST_LOG` takes precedence over `level` when set. Subsequent calls are
/// no-ops.
pub fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    let _ = subscriber.try_init();
}
