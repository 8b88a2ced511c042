//! Error types for the conversation orchestration core.

/// Top-level error type for the assistant core.
#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    /// Speech recognition error.
    #[error("recognition error: {0}")]
    Recognition(String),

    /// Language model request error.
    #[error("model error: {0}")]
    Model(String),

    /// Tool execution error.
    #[error("tool error: {0}")]
    Tool(String),

    /// Speech synthesis / playback error.
    #[error("speech error: {0}")]
    Speech(String),

    /// Health probe or recovery error.
    #[error("health error: {0}")]
    Health(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kinds of recognizer failure, used to pick the recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    /// No speech detected within the recognizer's window.
    NoSpeech,
    /// Transient network failure between us and the recognition service.
    Network,
    /// Anything else (audio device loss, permission revoked, ...).
    Other,
}

impl RecognitionErrorKind {
    /// Whether the recognizer should be restarted automatically.
    pub fn auto_restarts(self) -> bool {
        matches!(self, Self::NoSpeech | Self::Network)
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AssistantError>;
