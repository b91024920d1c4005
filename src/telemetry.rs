//! Tracing subscriber setup for the CLI.

use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber.
///
/// Default level is `info`; `--trace` flips the crate to `debug`. `RUST_LOG`
/// always wins when set so operators can scope filters per module.
pub fn init(trace: bool) {
    let default_directive = if trace {
        "info,tendervec=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
