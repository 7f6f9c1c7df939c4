//! Crate-wide error type.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bad request data: malformed dates, past schedule times, unknown paths
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Reading or decoding an audio file failed
    #[error("Audio error: {0}")]
    Audio(String),

    /// The playback thread is gone or refused a command
    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Download error: {0}")]
    Download(String),

    /// Language-model request or response failure
    #[error("Model error: {0}")]
    Model(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors caused by the caller's input rather than by the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidInput(_) | Error::AlreadyExists(_) | Error::NotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_classified() {
        assert!(Error::InvalidInput("x".into()).is_client_error());
        assert!(Error::AlreadyExists("x".into()).is_client_error());
        assert!(Error::NotFound("x".into()).is_client_error());
        assert!(!Error::Internal("x".into()).is_client_error());
        assert!(!Error::Playback("x".into()).is_client_error());
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.to_string(), "IO error: gone");
    }
}
