//! Trim ranges over video frame indices.
//!
//! Users express trims in terms of the frames they see, counted from the
//! first decodable frame of the file. The demuxer drops any non-keyframe
//! packets that precede the first keyframe, so internal frame indices start
//! later by that many frames. [`TrimSet::compile`] shifts the user's ranges
//! into the internal index space.

use std::fmt;
use std::str::FromStr;

use reelsync_common::Rational;

#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Half-open frame range `[start, end)`; `end == None` runs to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct TrimRange {
    /// First kept frame.
    pub start: i64,
    /// One past the last kept frame, or `None` for open-ended.
    pub end: Option<i64>,
}

impl TrimRange {
    /// Create a validated range.
    pub fn new(start: i64, end: Option<i64>) -> Result<Self> {
        if start < 0 {
            return Err(Error::invalid_trim(format!("negative start frame {start}")));
        }
        if let Some(end) = end {
            if end <= start {
                return Err(Error::invalid_trim(format!(
                    "empty range {start}:{end}"
                )));
            }
        }
        Ok(Self { start, end })
    }

    /// Range from `start` to the end of the video.
    pub fn open(start: i64) -> Self {
        Self {
            start: start.max(0),
            end: None,
        }
    }

    /// Whether `index` falls inside the range.
    pub fn contains(&self, index: i64) -> bool {
        index >= self.start && self.end.map_or(true, |end| index < end)
    }
}

impl fmt::Display for TrimRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}:{}", self.start, end),
            None => write!(f, "{}:max", self.start),
        }
    }
}

impl FromStr for TrimRange {
    type Err = Error;

    /// Parse `"start:end"`, `"start:max"` or `"start:"`.
    fn from_str(s: &str) -> Result<Self> {
        let (start, end) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| Error::invalid_trim(format!("expected start:end, got {s:?}")))?;
        let start = start
            .trim()
            .parse::<i64>()
            .map_err(|_| Error::invalid_trim(format!("bad start frame in {s:?}")))?;
        let end = match end.trim() {
            "" | "max" | "MAX" => None,
            e => Some(
                e.parse::<i64>()
                    .map_err(|_| Error::invalid_trim(format!("bad end frame in {s:?}")))?,
            ),
        };
        TrimRange::new(start, end)
    }
}

/// Ordered, non-overlapping trim ranges in internal frame index space.
///
/// An empty set keeps every frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct TrimSet {
    ranges: Vec<TrimRange>,
    offset: usize,
}

impl TrimSet {
    /// A set that keeps everything.
    pub fn keep_all() -> Self {
        Self::default()
    }

    /// Shift user ranges by the first-keyframe `offset`.
    ///
    /// Ranges that end at or before the offset are dropped, the rest are
    /// clamped at zero. If frames were skipped and nothing is left, a single
    /// all-inclusive range is used.
    pub fn compile(user_ranges: &[TrimRange], offset: usize) -> Result<Self> {
        validate(user_ranges)?;
        let shift = offset as i64;
        let mut ranges: Vec<TrimRange> = user_ranges
            .iter()
            .filter(|r| r.end.map_or(true, |end| end > shift))
            .map(|r| TrimRange {
                start: (r.start - shift).max(0),
                end: r.end.map(|end| end - shift),
            })
            .collect();
        if offset != 0 && ranges.is_empty() {
            ranges.push(TrimRange::open(0));
        }
        Ok(Self { ranges, offset })
    }

    /// Whether the frame at `index` is kept. Negative indices never are.
    pub fn contains(&self, index: i64) -> bool {
        if index < 0 {
            return false;
        }
        if self.ranges.is_empty() {
            return true;
        }
        let pos = self.ranges.partition_point(|r| r.start <= index);
        pos > 0 && self.ranges[pos - 1].contains(index)
    }

    /// Compiled ranges.
    pub fn ranges(&self) -> &[TrimRange] {
        &self.ranges
    }

    /// Offset the set was compiled with.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// True when no range restricts the output.
    pub fn is_unrestricted(&self) -> bool {
        self.ranges.is_empty()
    }

    /// End of the last range when it is closed.
    pub fn max_frame_index(&self) -> Option<i64> {
        self.ranges.last().and_then(|r| r.end)
    }

    /// True when the last range has an explicit end.
    pub fn has_explicit_end(&self) -> bool {
        self.max_frame_index().is_some()
    }

    /// Number of trimmed-out frames in `[0, frame)`.
    pub fn cut_before(&self, frame: i64) -> i64 {
        if self.ranges.is_empty() || frame <= 0 {
            return 0;
        }
        let kept: i64 = self
            .ranges
            .iter()
            .take_while(|r| r.start < frame)
            .map(|r| r.end.map_or(frame, |end| end.min(frame)) - r.start)
            .sum();
        frame - kept
    }

    /// Move a timestamp onto the trimmed output timeline by removing the
    /// duration of every trimmed-out frame before it.
    pub fn adjust_timestamp(&self, ts: i64, timebase: Rational, framerate: Rational) -> i64 {
        if self.ranges.is_empty() || !framerate.is_valid() {
            return ts;
        }
        let frame_tb = framerate.invert();
        let frame = Rational::rescale(ts, timebase, frame_tb);
        let cut = self.cut_before(frame);
        ts - Rational::rescale(cut, frame_tb, timebase)
    }
}

fn validate(ranges: &[TrimRange]) -> Result<()> {
    for pair in ranges.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        match prev.end {
            None => {
                return Err(Error::invalid_trim(format!(
                    "range {next} follows open-ended range {prev}"
                )))
            }
            Some(end) if next.start < end => {
                return Err(Error::invalid_trim(format!(
                    "range {next} overlaps or precedes {prev}"
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}
