//! Error type shared by the engine and its broker transports.

use std::time::Duration;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Errors that can occur while talking to the broker or waiting on a call.
///
/// Every variant carries owned strings so one failure can be fanned out to
/// all callers queued on the same topology gate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("Topology setup failed: {0}")]
    Topology(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Call '{command}' timed out after {}ms", .ttl.as_millis())]
    Timeout { command: String, ttl: Duration },

    #[error("Correlation id '{0}' is already registered")]
    DuplicateCorrelation(String),

    #[error("Remote handler failed: {0}")]
    Remote(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Broker connection closed before topology was established")]
    Disconnected,
}

impl RpcError {
    /// True for the expected end of a call that nobody answered.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = RpcError::Timeout {
            command: "sum".to_string(),
            ttl: Duration::from_millis(100),
        };
        assert_eq!(err.to_string(), "Call 'sum' timed out after 100ms");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_json_error_maps_to_codec() {
        let err: RpcError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, RpcError::Codec(_)));
    }
}
