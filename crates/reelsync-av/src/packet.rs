//! Demuxed packets.
//!
//! A [`Packet`] owns its payload as [`Bytes`], so handing it from the reader
//! thread to the consumer is a move, never a copy.

use bitflags::bitflags;
use bytes::Bytes;

bitflags! {
    /// Flags for packet properties.
    ///
    /// The high 16 bits carry the output track tag assigned when an
    /// auxiliary packet is accepted for output.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u32 {
        /// This packet starts a keyframe.
        const KEYFRAME = 0x0001;
        /// Packet data is corrupted.
        const CORRUPT = 0x0002;
        /// Packet should be discarded.
        const DISCARD = 0x0004;
    }
}

const TRACK_SHIFT: u32 = 16;
const LOW_MASK: u32 = 0xffff;

/// One demuxed packet of any stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Container stream index.
    pub stream_index: usize,
    /// Presentation timestamp in stream timebase.
    pub pts: Option<i64>,
    /// Decode timestamp in stream timebase.
    pub dts: Option<i64>,
    /// Duration in stream timebase.
    pub duration: i64,
    /// Packet flags and track tag.
    pub flags: PacketFlags,
    /// Payload.
    pub data: Bytes,
}

impl Packet {
    /// Create a packet without timing.
    pub fn new(stream_index: usize, data: impl Into<Bytes>) -> Self {
        Self {
            stream_index,
            pts: None,
            dts: None,
            duration: 0,
            flags: PacketFlags::empty(),
            data: data.into(),
        }
    }

    /// Set timestamps and duration.
    pub fn with_timing(mut self, pts: Option<i64>, dts: Option<i64>, duration: i64) -> Self {
        self.pts = pts;
        self.dts = dts;
        self.duration = duration;
        self
    }

    /// Mark as keyframe.
    pub fn with_keyframe(mut self, keyframe: bool) -> Self {
        self.set_keyframe(keyframe);
        self
    }

    /// Check if this is a keyframe packet.
    pub fn is_keyframe(&self) -> bool {
        self.flags.contains(PacketFlags::KEYFRAME)
    }

    /// Set the keyframe flag.
    pub fn set_keyframe(&mut self, keyframe: bool) {
        self.flags.set(PacketFlags::KEYFRAME, keyframe);
    }

    /// Store `track_id` in the high 16 bits of the flags.
    pub fn tag_track(&mut self, track_id: i32) {
        let tag = (track_id as i16 as u16 as u32) << TRACK_SHIFT;
        self.flags = PacketFlags::from_bits_retain((self.flags.bits() & LOW_MASK) | tag);
    }

    /// Track id stored by [`tag_track`](Self::tag_track), if any.
    pub fn track_tag(&self) -> Option<i32> {
        let tag = (self.flags.bits() >> TRACK_SHIFT) as u16 as i16 as i32;
        (tag != 0).then_some(tag)
    }

    /// Timestamp used for ordering: pts, else dts.
    pub fn timestamp(&self) -> Option<i64> {
        self.pts.or(self.dts)
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}
