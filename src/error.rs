//! Error types for chatvox.

use thiserror::Error;

/// Common error type for chatvox.
#[derive(Error, Debug)]
pub enum ChatvoxError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Validation error for caller-supplied input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Settings provider error.
    #[error("settings error: {0}")]
    Settings(String),

    /// User script failed to parse or raised a runtime error.
    ///
    /// Fatal for the session and surfaced to the caller as-is.
    #[error("script error: {0}")]
    Script(String),

    /// The script was aborted because its session was cancelled.
    #[error("script interrupted: session cancelled")]
    Interrupted,

    /// Scripting runtime could not be built or configured.
    #[error("engine error: {0}")]
    Engine(String),

    /// AI or TTS collaborator failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// The script thread could not be joined.
    #[error("join error: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for ChatvoxError {
    fn from(e: tokio::task::JoinError) -> Self {
        ChatvoxError::Join(e.to_string())
    }
}

/// Result type alias for chatvox operations.
pub type Result<T> = std::result::Result<T, ChatvoxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_display() {
        let err = ChatvoxError::Script("[string \"user_script\"]:1: boom".to_string());
        assert_eq!(
            err.to_string(),
            "script error: [string \"user_script\"]:1: boom"
        );
    }

    #[test]
    fn test_backend_error_display() {
        let err = ChatvoxError::Backend("connection refused".to_string());
        assert_eq!(err.to_string(), "backend error: connection refused");
    }

    #[test]
    fn test_validation_error_display() {
        let err = ChatvoxError::Validation("user id contains '/'".to_string());
        assert_eq!(err.to_string(), "validation error: user id contains '/'");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ChatvoxError = io_err.into();
        assert!(matches!(err, ChatvoxError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_result_alias() {
        fn sample_ok() -> Result<i32> {
            Ok(42)
        }

        fn sample_err() -> Result<i32> {
            Err(ChatvoxError::Settings("test".to_string()))
        }

        assert_eq!(sample_ok().unwrap(), 42);
        assert!(sample_err().is_err());
    }
}
