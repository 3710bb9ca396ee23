//! Tracing/logging initialization.
//!
//! Logs are JSON lines with a wall-clock timestamp, one object per event, so
//! the worker's output can be shipped as is. Span fields recorded by the
//! stores (`key`, `reference`, `reservation_id`, `snapshot_date`) appear on
//! every event emitted inside the span.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info";

/// Filter from `RUST_LOG`, or `default` when unset or unparsable.
pub fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init(default: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(default))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .with_current_span(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init(DEFAULT_FILTER);
        init("debug");
        ::tracing::info!("still logging");
    }
}
