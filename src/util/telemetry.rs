//! Structured logging setup.

/// Install the default env-filtered `tracing` subscriber for this process.
///
/// Dispatch, pool, and probe events are emitted via `tracing`; embedders that
/// already installed their own subscriber keep it, since this does nothing
/// once a dispatcher is set.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
