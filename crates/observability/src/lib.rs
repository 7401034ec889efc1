//! Tracing and logging setup shared by the binaries.

pub mod tracing;

pub use self::tracing::{LogFormat, ParseLogFormatError};

/// Initialize process-wide logging in the format named by `JOBQ_LOG_FORMAT`
/// (JSON when unset or unrecognized).
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    let format = LogFormat::from_env();
    self::tracing::init(format);
}
