//! Error types for the hub

use thiserror::Error;

/// Errors returned to callers of the hub
#[derive(Error, Debug)]
pub enum HubError {
    /// The hub is not in the running state
    #[error("Hub is not running")]
    NotRunning,

    /// Shutdown did not finish before its deadline
    #[error("Shutdown deadline elapsed")]
    ShutdownTimeout,

    /// A live connection already carries this identity
    #[error("Duplicate connection identity: {0}")]
    DuplicateIdentity(String),

    /// Failed to serialize an outbound message
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for hub operations
pub type Result<T> = std::result::Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_running() {
        assert_eq!(HubError::NotRunning.to_string(), "Hub is not running");
    }

    #[test]
    fn test_error_display_shutdown_timeout() {
        assert_eq!(
            HubError::ShutdownTimeout.to_string(),
            "Shutdown deadline elapsed"
        );
    }

    #[test]
    fn test_error_display_duplicate() {
        let err = HubError::DuplicateIdentity("alice".to_string());
        assert_eq!(err.to_string(), "Duplicate connection identity: alice");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<String>("not valid json").unwrap_err();
        let err: HubError = json_err.into();
        assert!(matches!(err, HubError::Serialization(_)));
        assert!(err.to_string().starts_with("Serialization error:"));
    }
}
