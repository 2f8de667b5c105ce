//! Hardware codec session boundary.
//!
//! The session itself (device setup, decode, encode) lives outside this
//! crate. The pipeline only hands it coded bytes with a timestamp and takes
//! coded bytes with a timestamp back.

use std::collections::VecDeque;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::convert::{find_converter, ColorSpace, ConvertEntry};
use crate::reader::{Timeline, VideoInfo};
use crate::{Error, Packet, Result};

/// Layout of decoded surfaces handed over by the session's decoder.
pub const DECODED_SURFACE: ColorSpace = ColorSpace::Nv12;

/// Coded video handed to or returned from a codec session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitstream {
    /// Coded bytes.
    pub data: Bytes,
    /// Timestamp in the video timebase.
    pub timestamp: i64,
    /// Decode timestamp, when known.
    pub dts: Option<i64>,
    /// Keyframe flag.
    pub keyframe: bool,
}

/// How timestamps are handed to the codec session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AvSyncMode {
    /// Frames are numbered by the pipeline; container pts are not passed on.
    #[default]
    Through,
    /// Container pts are passed to the session and checked downstream.
    CheckPts,
}

impl AvSyncMode {
    /// Build the bitstream for the `index`-th video packet.
    ///
    /// In [`Through`](Self::Through) mode the timestamp is synthesized from
    /// the frame index and the expected frame duration.
    pub fn bitstream(self, packet: Packet, index: u64, frame_duration: i64) -> Bitstream {
        let timestamp = match self {
            Self::CheckPts => packet
                .timestamp()
                .unwrap_or(index as i64 * frame_duration),
            Self::Through => index as i64 * frame_duration,
        };
        Bitstream {
            keyframe: packet.is_keyframe(),
            dts: packet.dts,
            timestamp,
            data: packet.data,
        }
    }

    /// Move a session output timestamp onto the trimmed output timeline.
    ///
    /// Synthesized timestamps already start at zero; container pts are
    /// rebased on the first video frame first.
    pub fn output_timestamp(self, timestamp: i64, timeline: &Timeline) -> i64 {
        match self {
            Self::Through => timeline.trims.adjust_timestamp(
                timestamp,
                timeline.video_timebase,
                timeline.framerate,
            ),
            Self::CheckPts => timeline.output_timestamp(timestamp, timeline.video_timebase),
        }
    }
}

/// An external encode/decode session.
pub trait HwSession: Send {
    /// Initialise with the Annex-B video header.
    fn init(&mut self, header: &[u8], info: &VideoInfo) -> Result<()>;

    /// Header of the produced bitstream, valid after `init`.
    fn output_header(&self) -> &[u8];

    /// Feed one coded input frame.
    fn submit(&mut self, bitstream: Bitstream) -> Result<()>;

    /// Take the next coded output frame, if one is ready.
    fn receive(&mut self) -> Result<Option<Bitstream>>;

    /// No more input; remaining output becomes available to `receive`.
    fn flush(&mut self) -> Result<()>;
}

/// Stream-copy session: output equals input.
#[derive(Debug, Default)]
pub struct CopySession {
    header: Option<Vec<u8>>,
    pending: VecDeque<Bitstream>,
    flushed: bool,
    encoder_input: Option<ColorSpace>,
    surface: Option<&'static ConvertEntry>,
}

impl CopySession {
    /// Create an uninitialised session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Session whose encoder takes `layout` instead of the decoded layout.
    pub fn with_encoder_input(layout: ColorSpace) -> Self {
        Self {
            encoder_input: Some(layout),
            ..Self::default()
        }
    }

    /// Surface converter picked by `init`, `None` when layouts already match.
    pub fn surface_converter(&self) -> Option<&'static ConvertEntry> {
        self.surface
    }
}

impl HwSession for CopySession {
    fn init(&mut self, header: &[u8], info: &VideoInfo) -> Result<()> {
        self.surface = match self.encoder_input {
            Some(layout) if layout != DECODED_SURFACE => {
                let entry = find_converter(DECODED_SURFACE, layout, false).ok_or_else(|| {
                    Error::session(format!(
                        "no surface converter from {DECODED_SURFACE:?} to {layout:?}"
                    ))
                })?;
                debug!(kernel = entry.name, requires = %entry.requires, "surface converter selected");
                Some(entry)
            }
            _ => None,
        };
        debug!(
            codec = ?info.codec,
            framerate = %info.avg_framerate,
            header_len = header.len(),
            "copy session initialised"
        );
        self.header = Some(header.to_vec());
        Ok(())
    }

    fn output_header(&self) -> &[u8] {
        self.header.as_deref().unwrap_or_default()
    }

    fn submit(&mut self, bitstream: Bitstream) -> Result<()> {
        if self.header.is_none() {
            return Err(Error::session("submit before init"));
        }
        if self.flushed {
            return Err(Error::session("submit after flush"));
        }
        self.pending.push_back(bitstream);
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Bitstream>> {
        Ok(self.pending.pop_front())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushed = true;
        Ok(())
    }
}
