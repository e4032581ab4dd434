//! Diagnostic tracing, written to stderr.
//!
//! The run report goes to stdout; tracing output never does.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directive for a `-v` count when `RUST_LOG` is unset.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "nebula=info,warn",
        2 => "nebula=debug,info",
        _ => "trace",
    }
}

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; otherwise the level follows `verbosity`.
///
/// # Example
/// ```bash
/// RUST_LOG=nebula::diff=debug nebula apply response.txt
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    // try_init: a second call (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
