//! Diagnostic logging for the CLI. Reports go to stdout, logs to stderr.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. `verbose` overrides it with `mender=debug`,
/// which also covers the `mender_core` and `mender_exec` targets.
pub fn init(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("mender=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
