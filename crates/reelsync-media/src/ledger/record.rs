//! Per-frame records kept by the ledger.

#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};

/// Picture structure reported by the bitstream parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub enum PicStruct {
    /// Progressive frame.
    #[default]
    Frame,
    /// Interlaced frame, top field first.
    FrameTff,
    /// Interlaced frame, bottom field first.
    FrameBff,
    /// Single top field.
    FieldTop,
    /// Single bottom field.
    FieldBottom,
}

impl PicStruct {
    /// True for single-field pictures.
    pub fn is_field(self) -> bool {
        matches!(self, Self::FieldTop | Self::FieldBottom)
    }

    /// True when `other` is the opposite-parity field of `self`.
    pub fn pairs_with(self, other: PicStruct) -> bool {
        matches!(
            (self, other),
            (Self::FieldTop, Self::FieldBottom) | (Self::FieldBottom, Self::FieldTop)
        )
    }
}

/// One demuxed video frame (or field) as tracked by the [`Ledger`](super::Ledger).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct FrameRecord {
    /// Presentation timestamp, filled in for every fixed record.
    pub pts: Option<i64>,
    /// Decode timestamp as demuxed.
    pub dts: Option<i64>,
    /// Duration in stream timebase ticks.
    pub duration: i64,
    /// Duration of the paired second field, if any.
    pub duration2: i64,
    /// Presentation order, `None` until resolved (and forever for second fields).
    pub poc: Option<u32>,
    /// Picture structure.
    pub pic_struct: PicStruct,
    /// Repeat count from pulldown flags (0 when absent).
    pub repeat: u8,
    /// Keyframe flag.
    pub keyframe: bool,
}

impl FrameRecord {
    /// Record for a demuxed packet, structure and poc still unknown.
    pub fn new(pts: Option<i64>, dts: Option<i64>, duration: i64, keyframe: bool) -> Self {
        Self {
            pts,
            dts,
            duration,
            keyframe,
            ..Self::default()
        }
    }

    /// Set the picture structure and repeat count.
    pub fn with_picture(mut self, pic_struct: PicStruct, repeat: u8) -> Self {
        self.pic_struct = pic_struct;
        self.repeat = repeat;
        self
    }

    /// Terminal sentinel appended on finalization.
    pub(crate) fn terminal(pts: i64) -> Self {
        Self::new(Some(pts), Some(pts), 0, false)
    }

    /// Presentation timestamp, `0` if still unresolved.
    pub fn timestamp(&self) -> i64 {
        self.pts.unwrap_or(0)
    }

    /// Full duration covered by the record, second field included.
    pub fn total_duration(&self) -> i64 {
        self.duration + self.duration2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_pairing() {
        assert!(PicStruct::FieldTop.pairs_with(PicStruct::FieldBottom));
        assert!(PicStruct::FieldBottom.pairs_with(PicStruct::FieldTop));
        assert!(!PicStruct::FieldTop.pairs_with(PicStruct::FieldTop));
        assert!(!PicStruct::Frame.pairs_with(PicStruct::FieldTop));
        assert!(PicStruct::FieldTop.is_field());
        assert!(!PicStruct::FrameTff.is_field());
    }

    #[test]
    fn test_total_duration() {
        let mut rec = FrameRecord::new(Some(0), None, 1501, true);
        rec.duration2 = 1502;
        assert_eq!(rec.total_duration(), 3003);
        assert_eq!(rec.timestamp(), 0);
    }
}
