//! Error types for reelsync-media.

use thiserror::Error;

/// Result type for reelsync-media operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for reelsync-media operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Trim ranges are malformed, unordered or overlapping.
    #[error("Invalid trim: {0}")]
    InvalidTrim(String),

    /// A frame rate or timebase cannot be used.
    #[error("Invalid rational: {0}")]
    InvalidRational(String),

    /// Error from the common crate.
    #[error(transparent)]
    Common(#[from] reelsync_common::Error),
}

impl Error {
    /// Create an invalid trim error.
    pub fn invalid_trim(msg: impl Into<String>) -> Self {
        Self::InvalidTrim(msg.into())
    }

    /// Create an invalid rational error.
    pub fn invalid_rational(msg: impl Into<String>) -> Self {
        Self::InvalidRational(msg.into())
    }
}
