//! Error types for Segue.

use thiserror::Error;

/// Result type alias using Segue's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Segue.
#[derive(Error, Debug)]
pub enum Error {
    // Graph construction errors
    #[error("Failed to construct playback graph: {0}")]
    Construction(String),

    #[error("Failed to link stream into the mixer: {0}")]
    Link(String),

    #[error("Failed to start playback of {0}")]
    Preroll(String),

    // Output errors
    #[error("Failed to open output device: {0}")]
    Output(String),

    #[error("Output device did not become ready within {timeout_ms} ms")]
    OutputTimeout { timeout_ms: u64 },

    // Facade errors
    #[error("Nothing to play")]
    NothingToPlay,

    #[error("No stream open for {0}")]
    NotFound(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    Config(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error categories reported to the application shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlayerErrorKind {
    /// The audio device could not be used.
    NoAudio,
    /// Something went wrong with a particular stream.
    General,
    /// The engine itself failed.
    Internal,
    /// The requested stream does not exist.
    NotFound,
}

impl Error {
    /// Map this error to the category reported to the shell.
    pub const fn player_kind(&self) -> PlayerErrorKind {
        match self {
            Self::Output(_) | Self::OutputTimeout { .. } | Self::Internal(_) => {
                PlayerErrorKind::Internal
            }
            Self::NotFound(_) => PlayerErrorKind::NotFound,
            _ => PlayerErrorKind::General,
        }
    }
}
