//! Error types for reelsync-av.

use std::path::PathBuf;

use reelsync_common::StreamKind;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the demux/mux pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The input has no stream of the required kind.
    #[error("no {kind} stream found")]
    StreamNotFound { kind: StreamKind },

    /// An explicitly requested track does not exist.
    #[error("{kind} track #{track} not found")]
    TrackNotFound { kind: StreamKind, track: u32 },

    /// The video codec cannot be decoded by the session.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// The codec header could not be extracted.
    #[error("missing codec header: {0}")]
    MissingHeader(String),

    /// Every selected auxiliary stream was lost during startup.
    #[error("no packets found for any selected audio/subtitle stream")]
    NoAuxPackets,

    /// The packet source failed.
    #[error("source error: {0}")]
    Source(String),

    /// The packet sink failed.
    #[error("sink error: {0}")]
    Sink(String),

    /// The codec session failed.
    #[error("codec session error: {0}")]
    Session(String),

    /// A pipeline stage was aborted or its peer went away.
    #[error("pipeline aborted: {0}")]
    Aborted(String),

    /// The specified file was not found.
    #[error("file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Timeline error.
    #[error(transparent)]
    Media(#[from] reelsync_media::Error),
}

impl Error {
    /// Create a source error.
    pub fn source_error(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }

    /// Create a sink error.
    pub fn sink_error(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    /// Create a codec session error.
    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session(msg.into())
    }

    /// Create an aborted error.
    pub fn aborted(msg: impl Into<String>) -> Self {
        Self::Aborted(msg.into())
    }

    /// Create an invalid input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a file not found error.
    pub fn file_not_found(path: impl Into<PathBuf>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// True for errors raised during setup (before any packet is produced).
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::StreamNotFound { .. }
                | Self::TrackNotFound { .. }
                | Self::UnsupportedCodec(_)
                | Self::MissingHeader(_)
                | Self::NoAuxPackets
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::TrackNotFound {
            kind: StreamKind::Audio,
            track: 3,
        };
        assert_eq!(err.to_string(), "audio track #3 not found");
        assert!(err.is_setup());

        let err = Error::StreamNotFound {
            kind: StreamKind::Video,
        };
        assert_eq!(err.to_string(), "no video stream found");

        let err = Error::session("device lost");
        assert_eq!(err.to_string(), "codec session error: device lost");
        assert!(!err.is_setup());
    }
}
