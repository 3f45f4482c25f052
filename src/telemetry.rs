//! Opt-in tracing setup.
//!
//! The library never installs a global subscriber on its own; hosts and test
//! binaries that want taskloom's spans and debug events call
//! [`init_tracing`] once at startup. Filtering follows the usual `RUST_LOG`
//! syntax.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a stderr fmt subscriber filtered by `RUST_LOG`.
///
/// Defaults to `error,taskloom=info` when the variable is unset. Returns
/// `false` if a global subscriber was already installed, so repeated calls
/// (e.g. from parallel tests) are harmless.
pub fn init_tracing() -> bool {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::CLOSE);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("error,taskloom=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
}
