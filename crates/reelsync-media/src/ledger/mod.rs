//! Frame position ledger.
//!
//! Records every demuxed video frame in demux order and resolves, as enough
//! lookahead arrives, each frame's presentation order (poc), presentation
//! timestamp and duration. A prefix of the presentation sequence becomes
//! "fixed" once its timing can no longer change; everything downstream
//! (framerate estimation, trim indices, auxiliary stream sync) only ever
//! looks at fixed frames.
//!
//! # Index spaces
//!
//! - **Demux index**: position in append order ([`Ledger::demuxed`]).
//! - **Frame index**: position in presentation order ([`Ledger::frame`]).
//!   A second field of a field pair has no frame index of its own; its
//!   duration is folded into the first field's `duration2`.
//!
//! After [`Ledger::finalize`], frame index `fixed_count()` addresses the
//! terminal sentinel, whose pts marks the end of the video.

mod progress;
mod record;

pub use progress::{LedgerProgress, ProgressSnapshot};
pub use record::{FrameRecord, PicStruct};

use std::io::{self, Write};
use std::sync::Arc;

/// Pending frames held back before presentation order is committed.
pub const REORDER_DEPTH: usize = 16;

/// How presentation timestamps are obtained for this stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PtsStatus {
    /// Not decided yet (no records seen by `fix`).
    #[default]
    Unknown,
    /// Demuxed pts are present.
    Valid,
    /// No pts at all; dts are used in their place.
    DtsOnly,
    /// Neither pts nor dts are usable; timestamps are synthesized.
    AllInvalid,
}

/// Append-only record of demuxed video frames with presentation resolution.
#[derive(Debug)]
pub struct Ledger {
    records: Vec<FrameRecord>,
    /// Frame index -> demux index.
    order: Vec<usize>,
    /// Scanned records still waiting for a poc.
    pending: Vec<usize>,
    scanned: usize,
    fixed: usize,
    open_field: Option<usize>,
    terminal: Option<FrameRecord>,
    status: PtsStatus,
    expected_duration: i64,
    container_duration: Option<i64>,
    progress: Arc<LedgerProgress>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            order: Vec::new(),
            pending: Vec::new(),
            scanned: 0,
            fixed: 0,
            open_field: None,
            terminal: None,
            status: PtsStatus::Unknown,
            expected_duration: 1,
            container_duration: None,
            progress: Arc::new(LedgerProgress::default()),
        }
    }

    /// Append a demuxed frame.
    pub fn append(&mut self, record: FrameRecord) {
        self.records.push(record);
    }

    /// Resolve presentation order and durations for whatever has enough
    /// lookahead, advancing the fixed count.
    ///
    /// Calling it again without new appends changes nothing.
    pub fn fix(&mut self, expected_frame_duration: i64) {
        if expected_frame_duration > 0 {
            self.expected_duration = expected_frame_duration;
        }
        if self.status == PtsStatus::Unknown && !self.records.is_empty() {
            self.status = detect_status(&self.records);
        }
        self.scan();
        self.assign_pocs();
        self.settle();
        self.publish();
    }

    /// Mark end of stream: append the terminal sentinel and fix every record.
    pub fn finalize(&mut self, last_pts: i64, container_duration: Option<i64>) {
        self.terminal = Some(FrameRecord::terminal(last_pts));
        self.container_duration = container_duration;
        let expected = self.expected_duration;
        self.fix(expected);
    }

    /// Number of appended records (demux order).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of frames with a resolved presentation position.
    pub fn presented_len(&self) -> usize {
        self.order.len()
    }

    /// Number of frames (presentation order prefix) whose timing is final.
    pub fn fixed_count(&self) -> usize {
        self.fixed
    }

    /// Whether [`finalize`](Self::finalize) has been called.
    pub fn is_finalized(&self) -> bool {
        self.terminal.is_some()
    }

    /// Timestamp mode decided by the first `fix`.
    pub fn pts_status(&self) -> PtsStatus {
        self.status
    }

    /// Duration most recently passed to `fix`.
    pub fn expected_duration(&self) -> i64 {
        self.expected_duration
    }

    /// Container-reported duration recorded at finalization.
    pub fn container_duration(&self) -> Option<i64> {
        self.container_duration
    }

    /// Record at a frame index, the terminal sentinel included.
    pub fn frame(&self, index: usize) -> Option<&FrameRecord> {
        match self.order.get(index) {
            Some(&demux) => self.records.get(demux),
            None if index == self.order.len() => self.terminal.as_ref(),
            None => None,
        }
    }

    /// Record at a demux index.
    pub fn demuxed(&self, index: usize) -> Option<&FrameRecord> {
        self.records.get(index)
    }

    /// Fixed frames in presentation order.
    pub fn fixed_frames(&self) -> impl Iterator<Item = &FrameRecord> + '_ {
        self.order[..self.fixed].iter().map(|&i| &self.records[i])
    }

    /// Highest `pts + duration` among records with a resolved pts.
    pub fn max_end_pts(&self) -> Option<i64> {
        self.records
            .iter()
            .filter_map(|r| {
                let duration = if r.duration > 0 {
                    r.duration
                } else {
                    self.expected_duration
                };
                r.pts.map(|pts| pts + duration)
            })
            .max()
    }

    /// True when every fixed frame is a progressive frame.
    pub fn is_progressive(&self) -> bool {
        self.fixed_frames().all(|r| r.pic_struct == PicStruct::Frame)
    }

    /// Shared progress counters for other threads.
    pub fn progress(&self) -> Arc<LedgerProgress> {
        Arc::clone(&self.progress)
    }

    /// Dump the presentation-ordered frame list, one frame per line.
    pub fn write_log<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(
            out,
            "# frames={} fixed={} status={:?} finalized={}",
            self.records.len(),
            self.fixed,
            self.status,
            self.is_finalized()
        )?;
        writeln!(out, "poc,pts,dts,duration,duration2,pic_struct,repeat,key")?;
        for (poc, &demux) in self.order.iter().enumerate() {
            let r = &self.records[demux];
            writeln!(
                out,
                "{},{},{},{},{},{:?},{},{}",
                poc,
                r.timestamp(),
                r.dts.map_or_else(|| "-".to_string(), |d| d.to_string()),
                r.duration,
                r.duration2,
                r.pic_struct,
                r.repeat,
                u8::from(r.keyframe)
            )?;
        }
        if let Some(t) = &self.terminal {
            writeln!(out, "# terminal pts={}", t.timestamp())?;
        }
        Ok(())
    }

    fn scan(&mut self) {
        while self.scanned < self.records.len() {
            let idx = self.scanned;
            self.scanned += 1;
            let pts = self.resolve_pts(idx);
            self.records[idx].pts = Some(pts);

            let pic = self.records[idx].pic_struct;
            if let Some(first) = self.open_field.take() {
                if self.records[first].pic_struct.pairs_with(pic) {
                    let second = self.records[idx].duration.max(0);
                    self.records[first].duration2 += second;
                    self.records[idx].poc = None;
                    continue;
                }
            }
            if pic.is_field() {
                self.open_field = Some(idx);
            }
            self.pending.push(idx);
        }
    }

    fn resolve_pts(&self, idx: usize) -> i64 {
        let rec = &self.records[idx];
        let demuxed = match self.status {
            PtsStatus::AllInvalid => None,
            PtsStatus::DtsOnly => rec.dts.or(rec.pts),
            PtsStatus::Valid | PtsStatus::Unknown => rec.pts.or(rec.dts),
        };
        match demuxed {
            Some(pts) => pts,
            None if self.status == PtsStatus::AllInvalid => idx as i64 * self.expected_duration,
            None => match idx.checked_sub(1).map(|p| &self.records[p]) {
                Some(prev) => {
                    let step = if prev.duration > 0 {
                        prev.duration
                    } else {
                        self.expected_duration
                    };
                    prev.timestamp() + step
                }
                None => 0,
            },
        }
    }

    fn assign_pocs(&mut self) {
        let lookahead = if self.is_finalized() { 0 } else { REORDER_DEPTH };
        while self.pending.len() > lookahead {
            let records = &self.records;
            let Some(pos) = self
                .pending
                .iter()
                .enumerate()
                .min_by_key(|(_, &i)| (records[i].timestamp(), i))
                .map(|(pos, _)| pos)
            else {
                break;
            };
            let idx = self.pending.remove(pos);
            self.records[idx].poc = Some(self.order.len() as u32);
            self.order.push(idx);
        }
    }

    fn settle(&mut self) {
        while self.fixed < self.order.len() {
            let next_pts = match self.order.get(self.fixed + 1) {
                Some(&next) => self.records[next].timestamp(),
                None => match &self.terminal {
                    Some(terminal) => terminal.timestamp(),
                    None => break,
                },
            };
            let expected = self.expected_duration;
            let all_invalid = self.status == PtsStatus::AllInvalid;
            let rec = &mut self.records[self.order[self.fixed]];
            if rec.duration <= 0 {
                let delta = next_pts - rec.timestamp();
                rec.duration = if !all_invalid && delta > rec.duration2 {
                    delta - rec.duration2
                } else {
                    expected
                };
            }
            self.fixed += 1;
        }
    }

    fn publish(&self) {
        let fixed_span = match (self.order.first(), self.fixed) {
            (Some(&first), fixed) if fixed > 0 => {
                let last = &self.records[self.order[fixed - 1]];
                last.timestamp() + last.total_duration() - self.records[first].timestamp()
            }
            _ => 0,
        };
        self.progress.publish(ProgressSnapshot {
            appended: self.records.len(),
            fixed: self.fixed,
            finalized: self.is_finalized(),
            fixed_span,
        });
    }
}

fn detect_status(records: &[FrameRecord]) -> PtsStatus {
    if records.iter().any(|r| r.pts.is_some()) {
        PtsStatus::Valid
    } else if records.iter().any(|r| r.dts.is_some()) {
        PtsStatus::DtsOnly
    } else {
        PtsStatus::AllInvalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pts: i64, dts: i64, duration: i64) -> FrameRecord {
        FrameRecord::new(Some(pts), Some(dts), duration, false)
    }

    /// IPBB-style reordering: demux order pts 0, 3, 1, 2, 6, 4, 5, ...
    fn reordered(count: usize, step: i64) -> Vec<FrameRecord> {
        let mut out = Vec::new();
        let mut base = 0;
        while out.len() < count {
            for off in [0, 3, 1, 2] {
                if out.len() == count {
                    break;
                }
                let dts = out.len() as i64 * step;
                out.push(frame((base + off) * step, dts, 0));
            }
            base += 4;
        }
        out
    }

    #[test]
    fn test_presentation_order_is_sorted() {
        let mut ledger = Ledger::new();
        for rec in reordered(64, 3003) {
            ledger.append(rec);
        }
        ledger.fix(3003);
        assert!(ledger.fixed_count() > 0);
        let pts: Vec<i64> = ledger.fixed_frames().map(|r| r.timestamp()).collect();
        let mut sorted = pts.clone();
        sorted.sort_unstable();
        assert_eq!(pts, sorted);
        assert!(ledger.fixed_frames().all(|r| r.duration == 3003));
    }

    #[test]
    fn test_fix_holds_back_reorder_window() {
        let mut ledger = Ledger::new();
        for rec in reordered(REORDER_DEPTH, 100) {
            ledger.append(rec);
        }
        ledger.fix(100);
        assert_eq!(ledger.fixed_count(), 0);
        assert_eq!(ledger.presented_len(), 0);
    }

    #[test]
    fn test_fix_is_idempotent() {
        let mut ledger = Ledger::new();
        for rec in reordered(40, 1001) {
            ledger.append(rec);
        }
        ledger.fix(1001);
        let fixed = ledger.fixed_count();
        let snapshot: Vec<FrameRecord> = ledger.fixed_frames().copied().collect();
        ledger.fix(1001);
        ledger.fix(1001);
        assert_eq!(ledger.fixed_count(), fixed);
        let again: Vec<FrameRecord> = ledger.fixed_frames().copied().collect();
        assert_eq!(snapshot, again);
    }

    #[test]
    fn test_frame_at_fixed_count_exists() {
        let mut ledger = Ledger::new();
        for rec in reordered(40, 10) {
            ledger.append(rec);
            ledger.fix(10);
            if ledger.fixed_count() > 0 {
                assert!(ledger.frame(ledger.fixed_count()).is_some());
            }
        }
    }

    #[test]
    fn test_finalize_fixes_everything() {
        let mut ledger = Ledger::new();
        for rec in reordered(32, 10) {
            ledger.append(rec);
        }
        ledger.fix(10);
        ledger.finalize(320, Some(12_345));
        assert!(ledger.is_finalized());
        assert_eq!(ledger.fixed_count(), ledger.len());
        let terminal = ledger.frame(ledger.fixed_count()).unwrap();
        assert_eq!(terminal.timestamp(), 320);
        assert_eq!(ledger.frame(31).unwrap().duration, 10);
        assert_eq!(ledger.container_duration(), Some(12_345));
        assert!(ledger.frame(ledger.fixed_count() + 1).is_none());
    }

    #[test]
    fn test_demuxed_durations_are_kept() {
        let mut ledger = Ledger::new();
        for i in 0..20 {
            ledger.append(frame(i * 3754, i * 3754, 3753));
        }
        ledger.finalize(20 * 3754, None);
        assert!(ledger.fixed_frames().all(|r| r.duration == 3753));
    }

    #[test]
    fn test_field_pairs_fold_into_duration2() {
        let mut ledger = Ledger::new();
        for i in 0..8 {
            let top = frame(i * 3600, i * 3600, 1800).with_picture(PicStruct::FieldTop, 0);
            let bottom =
                frame(i * 3600 + 1800, i * 3600 + 1800, 1800).with_picture(PicStruct::FieldBottom, 0);
            ledger.append(top);
            ledger.append(bottom);
        }
        ledger.finalize(8 * 3600, None);
        assert_eq!(ledger.len(), 16);
        assert_eq!(ledger.fixed_count(), 8);
        for rec in ledger.fixed_frames() {
            assert_eq!(rec.duration, 1800);
            assert_eq!(rec.duration2, 1800);
            assert!(rec.poc.is_some());
        }
        assert!(ledger.demuxed(1).unwrap().poc.is_none());
        assert!(!ledger.is_progressive());
    }

    #[test]
    fn test_all_invalid_synthesizes_timestamps() {
        let mut ledger = Ledger::new();
        for _ in 0..20 {
            ledger.append(FrameRecord::new(None, None, 0, false));
        }
        ledger.fix(1500);
        assert_eq!(ledger.pts_status(), PtsStatus::AllInvalid);
        ledger.finalize(20 * 1500, None);
        for (i, rec) in ledger.fixed_frames().enumerate() {
            assert_eq!(rec.timestamp(), i as i64 * 1500);
            assert_eq!(rec.duration, 1500);
        }
    }

    #[test]
    fn test_dts_only_uses_dts() {
        let mut ledger = Ledger::new();
        for i in 0..5 {
            ledger.append(FrameRecord::new(None, Some(i * 40), 0, false));
        }
        ledger.finalize(200, None);
        assert_eq!(ledger.pts_status(), PtsStatus::DtsOnly);
        assert_eq!(ledger.frame(3).unwrap().timestamp(), 120);
        assert_eq!(ledger.frame(4).unwrap().duration, 40);
    }

    #[test]
    fn test_missing_pts_is_interpolated() {
        let mut ledger = Ledger::new();
        ledger.append(frame(0, 0, 40));
        ledger.append(FrameRecord::new(None, None, 40, false));
        ledger.append(frame(80, 80, 40));
        ledger.finalize(120, None);
        assert_eq!(ledger.frame(1).unwrap().timestamp(), 40);
    }

    #[test]
    fn test_progress_snapshot() {
        let mut ledger = Ledger::new();
        let progress = ledger.progress();
        for i in 0..10 {
            ledger.append(frame(i * 10, i * 10, 10));
        }
        ledger.finalize(100, None);
        let snap = progress.snapshot();
        assert_eq!(snap.appended, 10);
        assert_eq!(snap.fixed, 10);
        assert!(snap.finalized);
        assert_eq!(snap.fixed_span, 100);
    }

    #[test]
    fn test_write_log() {
        let mut ledger = Ledger::new();
        ledger.append(FrameRecord::new(Some(0), None, 10, true));
        ledger.finalize(10, None);
        let mut out = Vec::new();
        ledger.write_log(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("0,0,-,10,0,Frame,0,1"));
        assert!(text.contains("# terminal pts=10"));
    }
}
