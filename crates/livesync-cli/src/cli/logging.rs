use tracing_subscriber::EnvFilter;

/// Env var holding a tracing filter directive, e.g. `livesync_core=debug`
pub const LOG_ENV: &str = "LIVESYNC_LOG";

/// Install a stderr fmt subscriber so stdout stays clean for the projection.
pub fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
