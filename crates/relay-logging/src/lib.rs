//! # relay-logging
//!
//! Structured logging setup for the relay gateway.
//!
//! - [`init_subscriber`] installs the global `tracing` subscriber in either
//!   human-readable or JSON form, honoring `RUST_LOG` over the configured level.
//! - [`capture_logs`] installs a thread-local capturing subscriber for tests.

#![deny(unsafe_code)]

pub mod test_utils;

pub use relay_settings::{LogFormat, LogLevel};
pub use test_utils::{CapturedEvent, CapturedLogs, capture_logs};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Build the env filter: `RUST_LOG` when set, otherwise `level`.
pub fn build_filter(level: &LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter_str()))
}

/// Initialize the global tracing subscriber writing to stderr.
///
/// Call once at startup. Subsequent calls are no-ops.
pub fn init_subscriber(level: &LogLevel, format: LogFormat) {
    let filter = build_filter(level);

    match format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_span_list(true)
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init();
        }
        LogFormat::Text => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .compact();
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init();
        }
    }
}
