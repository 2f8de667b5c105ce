//! Input boundary: packet sources and bitstream parsers.
//!
//! The container library behind a [`PacketSource`] is out of scope here; it
//! only has to describe its streams and hand out packets in file order.

use std::collections::VecDeque;

use reelsync_common::{Rational, StreamKind};
use reelsync_media::PicStruct;
use serde::{Deserialize, Serialize};

use crate::{Packet, Result};

/// Description of one container stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Container stream index.
    pub index: usize,
    /// Stream kind.
    pub kind: StreamKind,
    /// Codec name (`h264`, `hevc`, `aac`, ...).
    pub codec: String,
    /// Packet timebase.
    pub timebase: Rational,
    /// Framerate reported by the decoder, `0/0` when unknown.
    #[serde(default)]
    pub decoder_rate: Rational,
    /// Framerate from the codec parameters, `0/0` when unknown.
    #[serde(default)]
    pub codec_rate: Rational,
    /// Codec ticks per frame.
    #[serde(default = "default_ticks_per_frame")]
    pub ticks_per_frame: i64,
    /// Audio channel count.
    #[serde(default)]
    pub channels: u16,
    /// Codec header (extradata).
    #[serde(default, with = "hex_bytes")]
    pub header: Vec<u8>,
}

fn default_ticks_per_frame() -> i64 {
    1
}

impl StreamInfo {
    /// Minimal description, mostly for tests and synthetic inputs.
    pub fn new(index: usize, kind: StreamKind, codec: impl Into<String>, timebase: Rational) -> Self {
        Self {
            index,
            kind,
            codec: codec.into(),
            timebase,
            decoder_rate: Rational::new(0, 0),
            codec_rate: Rational::new(0, 0),
            ticks_per_frame: 1,
            channels: 0,
            header: Vec::new(),
        }
    }
}

/// Video codecs the hardware session can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// H.264 / AVC.
    H264,
    /// H.265 / HEVC.
    Hevc,
    /// MPEG-1 video.
    Mpeg1,
    /// MPEG-2 video.
    Mpeg2,
    /// VP8.
    Vp8,
    /// VP9.
    Vp9,
}

impl VideoCodec {
    /// Map a codec name; `None` for codecs the session cannot decode.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "h264" | "avc" | "avc1" => Some(Self::H264),
            "hevc" | "h265" | "hvc1" | "hev1" => Some(Self::Hevc),
            "mpeg1video" | "mpeg1" => Some(Self::Mpeg1),
            "mpeg2video" | "mpeg2" => Some(Self::Mpeg2),
            "vp8" => Some(Self::Vp8),
            "vp9" => Some(Self::Vp9),
            _ => None,
        }
    }

    /// Canonical codec name.
    pub fn name(self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Hevc => "hevc",
            Self::Mpeg1 => "mpeg1video",
            Self::Mpeg2 => "mpeg2video",
            Self::Vp8 => "vp8",
            Self::Vp9 => "vp9",
        }
    }

    /// Whether a codec header is required to start decoding.
    pub fn needs_header(self) -> bool {
        matches!(self, Self::H264 | Self::Hevc)
    }
}

/// Reads packets from a container.
pub trait PacketSource: Send {
    /// Streams in the container.
    fn streams(&self) -> &[StreamInfo];

    /// Next packet in file order, `None` at end of file.
    fn read_packet(&mut self) -> Result<Option<Packet>>;

    /// Container duration in microseconds, if known.
    fn container_duration(&self) -> Option<i64> {
        None
    }
}

/// Picture-level facts a bitstream parser extracts from a video packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PictureInfo {
    /// Picture structure.
    pub pic_struct: PicStruct,
    /// Pulldown repeat count.
    pub repeat: u8,
}

/// Parses picture structure from coded video.
pub trait PictureParser: Send {
    /// Inspect one packet. `header` is the container-native codec header.
    fn parse(&mut self, header: &[u8], packet: &Packet) -> PictureInfo;
}

/// Parser that reports every packet as a progressive frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressiveParser;

impl PictureParser for ProgressiveParser {
    fn parse(&mut self, _header: &[u8], _packet: &Packet) -> PictureInfo {
        PictureInfo::default()
    }
}

/// In-memory packet source.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    streams: Vec<StreamInfo>,
    packets: VecDeque<Packet>,
    duration: Option<i64>,
}

impl MemorySource {
    /// Create a source from streams and packets in file order.
    pub fn new(streams: Vec<StreamInfo>, packets: impl IntoIterator<Item = Packet>) -> Self {
        Self {
            streams,
            packets: packets.into_iter().collect(),
            duration: None,
        }
    }

    /// Set the container duration in microseconds.
    pub fn with_duration(mut self, micros: i64) -> Self {
        self.duration = Some(micros);
        self
    }
}

impl PacketSource for MemorySource {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        Ok(self.packets.pop_front())
    }

    fn container_duration(&self) -> Option<i64> {
        self.duration
    }
}

/// Hex (de)serialization for byte blobs.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
