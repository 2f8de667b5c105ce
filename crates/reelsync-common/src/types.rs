//! Core type definitions for streams and output tracks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of elementary stream in a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// The primary video stream.
    Video,
    /// An audio stream.
    Audio,
    /// A subtitle stream.
    Subtitle,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
            Self::Subtitle => write!(f, "subtitle"),
        }
    }
}

/// Identifies one auxiliary output track.
///
/// Audio tracks are numbered `1, 2, 3, ...` and subtitle tracks
/// `-1, -2, ...` in the order they appear in the input. A track split by
/// channel mask produces several sub-streams sharing the same `track_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackKey {
    /// Track number, positive for audio and negative for subtitles.
    pub track_id: i32,
    /// Sub-stream number within the track.
    pub sub_stream: u32,
}

impl TrackKey {
    /// Create a track key.
    pub const fn new(track_id: i32, sub_stream: u32) -> Self {
        Self {
            track_id,
            sub_stream,
        }
    }

    /// Stream kind implied by the sign of the track id.
    pub fn kind(&self) -> StreamKind {
        if self.track_id < 0 {
            StreamKind::Subtitle
        } else {
            StreamKind::Audio
        }
    }
}

impl fmt::Display for TrackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}.{}", self.kind(), self.track_id.unsigned_abs(), self.sub_stream)
    }
}
