//! Tracing and logging setup shared by every binary.

/// Initialize process-wide tracing for `service`.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init(service: &str) {
    tracing::init(service, tracing::LogFormat::from_env());
}

/// Subscriber configuration (format, filter).
pub mod tracing;

pub use self::tracing::LogFormat;
