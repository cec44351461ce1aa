//! Logging setup for the harness.
//!
//! Structured logging via `tracing`. The harness logs rebuilds, process
//! launches and proxy failures; `RUST_LOG` overrides the defaults.
//!
//! ```rust,no_run
//! use fob_harness::logger::init_logger;
//!
//! init_logger(false, false, false);
//! tracing::info!("Harness starting");
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERBOSE_FILTER: &str = "fob_harness=debug";
const QUIET_FILTER: &str = "fob_harness=error";
const DEFAULT_FILTER: &str = "fob_harness=info";

/// Install the global subscriber.
///
/// Precedence: `verbose` (debug), then `quiet` (errors only), then
/// `RUST_LOG`, then info for this crate. Call once, before any logging;
/// later calls are ignored.
pub fn init_logger(verbose: bool, quiet: bool, no_color: bool) {
    init_logger_with_filter(filter_for(verbose, quiet), no_color);
}

/// Install the global subscriber with an explicit filter.
pub fn init_logger_with_filter(filter: EnvFilter, no_color: bool) {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_level(true)
        .with_ansi(!no_color)
        .with_writer(std::io::stderr)
        .compact();

    // A subscriber may already be set (tests, embedding apps)
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

fn filter_for(verbose: bool, quiet: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new(VERBOSE_FILTER)
    } else if quiet {
        EnvFilter::new(QUIET_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }
}
