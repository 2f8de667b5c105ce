//! Auxiliary stream (audio/subtitle) synchronization against trimmed video.
//!
//! Each auxiliary packet is matched to the video frame it overlaps and kept
//! or dropped depending on whether that frame survives trimming. Packets
//! straddling a trim boundary are decided by how much of them falls outside
//! the kept video, with a per-stream drift accumulator so rounding errors at
//! successive boundaries cancel instead of piling up.

use reelsync_common::{Rational, TrackKey};
use tracing::trace;

use crate::ledger::Ledger;
use crate::trim::TrimSet;

/// Cursor value before any packet has been matched.
pub const BEFORE_START: i64 = -1;

/// Per auxiliary stream synchronization state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxStreamState {
    /// Output track this state belongs to.
    pub key: TrackKey,
    /// Container stream index.
    pub stream_index: usize,
    /// Stream timebase.
    pub timebase: Rational,
    /// Last matched video frame index, never decreases.
    pub last_matched: i64,
    /// Accumulated rounding error at trim boundaries, in stream ticks.
    pub drift: i64,
    /// Start delay of the stream relative to the kept video, in stream ticks.
    pub delay: i64,
}

impl AuxStreamState {
    /// Fresh state for a stream.
    pub fn new(key: TrackKey, stream_index: usize, timebase: Rational) -> Self {
        Self {
            key,
            stream_index,
            timebase,
            last_matched: BEFORE_START,
            drift: 0,
            delay: 0,
        }
    }
}

/// Timing of one auxiliary packet in its stream timebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketSpan {
    /// Presentation timestamp.
    pub pts: i64,
    /// Duration.
    pub duration: i64,
}

impl PacketSpan {
    /// Create a span.
    pub fn new(pts: i64, duration: i64) -> Self {
        Self { pts, duration }
    }

    fn end(&self) -> i64 {
        self.pts + self.duration
    }
}

/// Accept/reject decisions for auxiliary packets.
#[derive(Debug, Clone, Copy)]
pub struct SyncFilter<'a> {
    ledger: &'a Ledger,
    trims: &'a TrimSet,
    video_timebase: Rational,
}

impl<'a> SyncFilter<'a> {
    /// Create a filter over the current ledger and compiled trims.
    pub fn new(ledger: &'a Ledger, trims: &'a TrimSet, video_timebase: Rational) -> Self {
        Self {
            ledger,
            trims,
            video_timebase,
        }
    }

    /// Index of the last frame whose pts is not after `pts`, scanning from
    /// `start`. Returns `-1` when `pts` precedes the first frame.
    ///
    /// Before finalization a `pts` at or after the newest presented frame
    /// matches that frame. Once finalized, a `pts` at or after the terminal
    /// sentinel returns one past it.
    pub fn frame_index_for(&self, pts: i64, timebase: Rational, start: i64) -> i64 {
        let searchable = self.searchable_frames();
        let mut index = start.max(0) as usize;
        while index < searchable {
            let Some(frame) = self.ledger.frame(index) else {
                break;
            };
            if Rational::compare_ts(pts, timebase, frame.timestamp(), self.video_timebase).is_lt() {
                return index as i64 - 1;
            }
            index += 1;
        }
        if self.ledger.is_finalized() {
            searchable as i64
        } else {
            searchable as i64 - 1
        }
    }

    /// Decide whether `packet` is kept, updating the stream's cursor and drift.
    pub fn accept(&self, packet: PacketSpan, state: &mut AuxStreamState) -> bool {
        let found = self.frame_index_for(packet.pts, state.timebase, state.last_matched);
        let matched = found.max(state.last_matched);
        state.last_matched = matched;

        let Some(frame) = self.ledger.frame(matched.max(0) as usize) else {
            trace!(track = %state.key, pts = packet.pts, "past end of video, dropped");
            return false;
        };
        let video_end = if matched >= 0 {
            frame.timestamp() + frame.total_duration()
        } else {
            frame.timestamp()
        };
        let video_end = Rational::rescale(video_end, self.video_timebase, state.timebase);

        let half = packet.duration / 2;
        let in_range = self.trims.contains(matched);
        let next_in_range = self.trims.contains(matched + 1);

        let accepted = if in_range {
            if packet.end() < video_end || next_in_range {
                true
            } else {
                let overflow = packet.end() - video_end;
                if overflow + state.drift <= half {
                    state.drift += overflow;
                    true
                } else {
                    state.drift -= video_end - packet.pts;
                    false
                }
            }
        } else if next_in_range && packet.end() > video_end {
            let outside = video_end - packet.pts;
            if outside + state.drift <= half {
                state.drift += outside;
                true
            } else {
                state.drift -= packet.end() - video_end;
                false
            }
        } else {
            false
        };

        trace!(
            track = %state.key,
            pts = packet.pts,
            frame = matched,
            drift = state.drift,
            accepted,
            "aux packet"
        );
        accepted
    }

    fn searchable_frames(&self) -> usize {
        self.ledger.presented_len() + usize::from(self.ledger.is_finalized())
    }
}
