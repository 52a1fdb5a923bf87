//! Tracing setup for the command-line binary.

use tracing_subscriber::EnvFilter;

/// Installs the global subscriber, writing to stderr.
///
/// `RUST_LOG` wins when set; otherwise `storyloop` logs at `info`, or at
/// `debug` with `verbose`.
pub fn init(verbose: bool) {
    let default_level = if verbose { "storyloop=debug" } else { "storyloop=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
