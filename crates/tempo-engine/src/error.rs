//! Engine error taxonomy.
//!
//! Every variant is recoverable: the engine reports it and returns to a stable state.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by [`crate::engine::AudioPlaybackEngine`].
#[derive(Clone, Debug, Error, PartialEq)]
pub enum EngineError {
    /// The source locator is unreadable or does not contain decodable audio.
    #[error("invalid source {locator}: {reason}")]
    InvalidSource { locator: String, reason: String },

    /// Transcoding the source into the scratch file failed or was cancelled.
    #[error("export failed: {reason}")]
    ExportFailed { reason: String, cancelled: bool },

    /// The output device or stream could not be started.
    #[error("audio graph failed to start: {reason}")]
    GraphStartFailed { reason: String },

    /// Decoding or rendering stopped before the end of the file.
    #[error("playback failed: {reason}")]
    PlaybackFailed { reason: String },

    /// Tempo rates must be finite and strictly positive.
    #[error("invalid tempo rate {rate}; must be finite and > 0")]
    InvalidTempo { rate: f32 },
}

impl EngineError {
    pub(crate) fn invalid_source(locator: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidSource {
            locator: locator.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn export(reason: impl ToString) -> Self {
        Self::ExportFailed {
            reason: reason.to_string(),
            cancelled: false,
        }
    }

    pub(crate) fn playback(reason: impl ToString) -> Self {
        Self::PlaybackFailed {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn graph_start(reason: impl ToString) -> Self {
        Self::GraphStartFailed {
            reason: reason.to_string(),
        }
    }

    /// Export error used when a newer session replaced this one.
    pub(crate) fn superseded() -> Self {
        Self::ExportFailed {
            reason: "superseded by a newer session".to_string(),
            cancelled: true,
        }
    }

    /// Whether this error came from a cancelled export rather than a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::ExportFailed { cancelled: true, .. })
    }
}
