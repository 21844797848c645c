use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Signalling error: {0}")]
    Signalling(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("Protocol error [{message}]: {reason}")]
    Protocol { message: String, reason: String },

    #[error("Session closed")]
    SessionClosed,
}

impl AppError {
    /// Shorthand for a data channel protocol error
    pub fn protocol(message: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
