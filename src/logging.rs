use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, e.g. `MATOME_LOG=matome=debug`.
pub const LOG_ENV: &str = "MATOME_LOG";

/// Installs a global `fmt` subscriber for applications that have none.
///
/// Libraries embedding sessions should leave subscriber setup to their own
/// composition root and, where needed, hand a dispatcher to
/// [`SessionBuilder::dispatch`](crate::SessionBuilder::dispatch) instead.
pub fn init_logging() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}
