use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "ROLLCALLD_LOG";

/// Logs go to stderr; stdout carries IPC responses.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
