//! Error types for the Aria gateway

use thiserror::Error;

/// Result type alias for Aria operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device unavailable or access denied
    #[error("device error: {0}")]
    Device(String),

    /// Session open failed (network, authorization)
    #[error("connection error: {0}")]
    Connection(String),

    /// A single audio chunk could not be encoded or decoded
    ///
    /// Recoverable: the chunk is dropped and the session continues.
    #[error("decode error: {0}")]
    Decode(String),

    /// Mid-session transport failure; fatal to the session
    #[error("transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error terminates the session.
    ///
    /// Decode errors on individual chunks are recovered locally; everything
    /// else escalates to the session controller's fatal path.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Decode(_))
    }
}
