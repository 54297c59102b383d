//! Adapter error types.

use thiserror::Error;

/// Result type for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Errors surfaced by printer backend adapters.
///
/// Transport-level failures (`Unreachable`, `Timeout`) are recoverable:
/// the next call may succeed once the printer is back. `Firmware` errors
/// are not retried by the adapter; higher layers decide.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The printer could not be reached over its transport.
    #[error("printer unreachable: {0}")]
    Unreachable(String),

    /// The firmware reported an error or halted.
    #[error("firmware error: {0}")]
    Firmware(String),

    /// No response within the deadline.
    #[error("timeout after {seconds}s waiting for response to {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// Local file missing for an upload.
    #[error("local file not found: {0}")]
    FileNotFound(String),

    /// Local file unreadable for an upload.
    #[error("permission denied reading {0}")]
    PermissionDenied(String),

    /// Requested temperature rejected before any byte was sent.
    #[error("{heater} temperature {requested}\u{b0}C outside safe range 0..={ceiling}\u{b0}C")]
    TemperatureOutOfRange {
        heater: &'static str,
        requested: f64,
        ceiling: f64,
    },

    /// Operation not supported by this backend.
    #[error("{operation} is not supported by the {adapter} adapter")]
    Unsupported {
        adapter: &'static str,
        operation: &'static str,
    },

    /// Malformed or unexpected response from the backend.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid argument supplied by the caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl AdapterError {
    /// Whether this error represents a transient transport condition.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout { .. })
    }

    pub(crate) fn unsupported(adapter: &'static str, operation: &'static str) -> Self {
        Self::Unsupported { adapter, operation }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(AdapterError::Unreachable("no route".into()).is_transient());
        assert!(AdapterError::Timeout {
            operation: "M105".into(),
            seconds: 10
        }
        .is_transient());
        assert!(!AdapterError::Firmware("halted".into()).is_transient());
        assert!(!AdapterError::FileNotFound("x.gcode".into()).is_transient());
    }
}
