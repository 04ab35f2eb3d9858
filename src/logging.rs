//! Logging setup for the `geoextract` binary.
//!
//! Everything goes to stderr: the worker subcommand uses stdout as its
//! message channel, and the extract subcommand may write GeoJSON there.
//! `RUST_LOG` overrides the level chosen from the `-q` count.

use std::io;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Default filter for a given `-q` count.
pub fn default_level(quiet: u8) -> &'static str {
    match quiet {
        0 => "info",
        1 => "warn",
        _ => "error",
    }
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init_logging(quiet: u8) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level(quiet)));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .try_init();
}
