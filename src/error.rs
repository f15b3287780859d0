//! Error types for the murmur voice pipeline

use thiserror::Error;

/// Result type alias for murmur operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Microphone or speaker missing, or access denied
    #[error("capture unavailable: {0}")]
    DeviceUnavailable(String),

    /// Capture refused while the assistant is processing or speaking
    #[error("busy: {0}")]
    Busy(&'static str),

    /// Speech-to-text provider error
    #[error("STT error: {0}")]
    Stt(String),

    /// Chat provider error
    #[error("chat error: {0}")]
    Chat(String),

    /// Text-to-speech provider error
    #[error("TTS error: {0}")]
    Tts(String),

    /// HTTP transport error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Empty, too short, too long or malformed input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Transcript presumed to be the assistant's own voice
    #[error("self echo suppressed: {0}")]
    SelfEchoSuppressed(String),

    /// Result belongs to a superseded response
    #[error("stale result for response {0}")]
    StaleResult(u64),

    /// Audio encode, decode or device stream error
    #[error("audio error: {0}")]
    Audio(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),
}

/// Coarse classification used for status reporting and propagation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    DeviceUnavailable,
    Transport,
    InvalidInput,
    SelfEchoSuppressed,
    StaleResult,
    Busy,
    Internal,
}

impl Error {
    /// Classify this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            Self::Stt(_) | Self::Chat(_) | Self::Tts(_) | Self::Http(_) => ErrorKind::Transport,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::SelfEchoSuppressed(_) => ErrorKind::SelfEchoSuppressed,
            Self::StaleResult(_) => ErrorKind::StaleResult,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Audio(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Toml(_)
            | Self::Database(_)
            | Self::Sqlite(_)
            | Self::NotFound(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error is a deliberate no-op that must never reach the user
    #[must_use]
    pub const fn is_silent(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SelfEchoSuppressed | ErrorKind::StaleResult
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert_eq!(Error::Stt("x".into()).kind(), ErrorKind::Transport);
        assert_eq!(Error::Chat("x".into()).kind(), ErrorKind::Transport);
        assert_eq!(Error::Tts("x".into()).kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_silent_errors() {
        assert!(Error::StaleResult(3).is_silent());
        assert!(Error::SelfEchoSuppressed("hi".into()).is_silent());
        assert!(!Error::InvalidInput("".into()).is_silent());
        assert!(!Error::DeviceUnavailable("denied".into()).is_silent());
    }
}
