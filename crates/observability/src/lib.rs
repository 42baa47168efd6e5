use tracing_subscriber::{EnvFilter, fmt};

/// Installs the process-wide subscriber. `log_filter` uses `EnvFilter` syntax
/// and falls back to `info` when it does not parse.
pub fn init_tracing(service_name: &str, log_filter: &str) {
    let env_filter = EnvFilter::try_new(log_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_target(false)
        .with_env_filter(env_filter)
        .compact()
        .try_init();

    tracing::info!(service = service_name, log_filter, "tracing initialized");
}
