//! Process-wide tracing setup and the spans every job run is logged under.

/// Initialize process-wide logging.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Subscriber installation (JSON, `RUST_LOG` filter).
pub mod tracing;

/// Job and step spans.
pub mod span;

pub use span::{job_span, partition_span, step_span};
