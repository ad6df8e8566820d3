//! Error types shared by the turn-taking core and the session layer.

use thiserror::Error;

/// Result alias used throughout `parley-core`.
pub type ParleyResult<T> = Result<T, ParleyError>;

/// Errors raised while configuring or driving a conversation session.
#[derive(Error, Debug)]
pub enum ParleyError {
    /// Algorithm thresholds that violate their ordering or range constraints.
    #[error("Invalid algorithm options: {0}")]
    InvalidOptions(String),

    /// Invalid modality/mode/handler combination. Fatal at construction time.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The speech model failed to score a chunk.
    #[error("Speech model error: {0}")]
    SpeechModel(#[source] anyhow::Error),

    /// The user-supplied reply function failed while producing output.
    #[error("Reply generator failed: {0}")]
    Generator(#[source] anyhow::Error),

    /// The underlying media transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An offer reused the id of a live session.
    #[error("Session already exists: {0}")]
    DuplicateSession(String),

    /// A channel the caller depends on has been closed.
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ParleyError::InvalidOptions("speech_threshold must be >= 0".into());
        assert_eq!(
            err.to_string(),
            "Invalid algorithm options: speech_threshold must be >= 0"
        );

        let err = ParleyError::Generator(anyhow::anyhow!("boom"));
        assert_eq!(err.to_string(), "Reply generator failed: boom");

        let err = ParleyError::ChannelClosed("pause events");
        assert_eq!(err.to_string(), "Channel closed: pause events");
    }
}
