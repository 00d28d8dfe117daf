//! Tracing setup for dnsbench
//!
//! Diagnostics go to stderr so they never interleave with the measured
//! output on stdout (status lines, per-query lines, the statistics block).

use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize tracing with the given default level filter.
///
/// `RUST_LOG` overrides the level when set, following the usual
/// `EnvFilter` syntax.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
