//! Tracing setup shared by the allocation binaries and test harnesses.

/// Initialize process-wide tracing.
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Like [`init`], but with a fallback filter used when `RUST_LOG` is unset.
pub fn init_with_default(directives: &str) {
    tracing::init_with_default(directives);
}

/// Subscriber configuration (filters, JSON formatting).
pub mod tracing;
