//! Structured tracing setup, for binaries embedding this transport that want
//! a ready-made subscriber with span timing and file/line info.
//!
//! This is optional ambient wiring, not something the pipeline depends on —
//! the pipeline emits `tracing` events regardless of whether a subscriber is
//! installed; this module just makes installing one trivial for a caller
//! that has not already set one up themselves.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Installs a global tracing subscriber with span-close timing, file/line
/// info, and level filtering at `DEBUG`.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_file(true)
                .with_line_number(true)
                .with_level(true)
                .with_filter(LevelFilter::DEBUG),
        )
        .init();
}
