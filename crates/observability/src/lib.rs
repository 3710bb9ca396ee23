//! Process-wide tracing setup shared by the stock ledger binaries.

/// Initialize process-wide logging with the default `info` filter.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::DEFAULT_FILTER);
}

/// Like [`init`], with a caller-chosen fallback when `RUST_LOG` is unset.
pub fn init_with_default(directive: &str) {
    tracing::init(directive);
}

/// Subscriber construction (filters, JSON layer).
pub mod tracing;
