//! Tracing/logging setup shared by the demo binary and tests.

/// Initialize process-wide logging with defaults (JSON, `info`, `RUST_LOG` wins).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Subscriber configuration (format, filters).
pub mod tracing;

pub use tracing::{LogFormat, ObservabilityConfig, init_with};
