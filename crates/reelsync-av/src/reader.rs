//! Demux reader.
//!
//! [`Demuxer::open`] runs the whole startup phase on the caller's thread:
//! stream selection, framerate estimation over the first frames, trim
//! compilation and first-sample capture. After that a reader thread (or the
//! consumer itself, when `reader_threads` is 0) keeps pulling packets:
//!
//! - video packets are recorded in the [`Ledger`] and pushed to the video
//!   queue, which is bounded and blocks the reader when full;
//! - auxiliary packets are staged in L1 until the ledger has fixed the video
//!   frames they overlap, then run through the [`SyncFilter`] and moved to
//!   the ready queue (L2) tagged with their output track.
//!
//! The ledger is only ever touched by whichever thread owns the
//! `DemuxCore`; other threads see its progress through [`LedgerProgress`].

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use reelsync_common::{Rational, StreamKind, TrackKey};
use reelsync_media::estimate::FALLBACK_FRAMERATE;
use reelsync_media::{
    AuxStreamState, Estimate, EstimatorInput, FrameRecord, FrameSupply, FramerateEstimator,
    Ledger, LedgerProgress, PacketSpan, PtsStatus, SyncFilter, TrimRange, TrimSet, REORDER_DEPTH,
};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::bitstream::{is_length_prefixed, AnnexBConverter, StreamHeader};
use crate::queue::{PacketQueue, QueueUsage, UNBOUNDED};
use crate::source::{PacketSource, PictureParser, StreamInfo, VideoCodec};
use crate::{Error, Packet, Result};

/// Frames read past the end of the last trim range before reading stops.
pub const TRIM_OVERREAD_FRAMES: usize = 128;

/// Default bound of the video queue once startup is over.
pub const DEFAULT_VIDEO_CAPACITY: usize = REORDER_DEPTH * 16;

/// Which tracks of a kind to select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackSelect {
    /// Every track of the kind.
    #[default]
    All,
    /// The n-th track of the kind, counting from 1.
    Track(u32),
}

impl FromStr for TrackSelect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        match s.parse::<u32>() {
            Ok(n) if n > 0 => Ok(Self::Track(n)),
            _ => Err(Error::invalid_input(format!(
                "invalid track selector '{s}': expected 'all' or a track number"
            ))),
        }
    }
}

/// Audio track selection with optional channel split.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AudioSelect {
    /// Track(s) to select.
    pub track: TrackSelect,
    /// Channel masks; each mask becomes one output sub-stream.
    pub split: Vec<u64>,
}

/// Reader configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderSettings {
    /// User trim ranges in frame index space.
    pub trims: Vec<TrimRange>,
    /// Audio selectors; empty selects no audio.
    pub audio: Vec<AudioSelect>,
    /// Subtitle selectors; empty selects no subtitles.
    pub subtitles: Vec<TrackSelect>,
    /// Limit of the framerate analysis, in seconds.
    pub analyze_secs: Option<u32>,
    /// Overrides the estimated average framerate.
    pub forced_framerate: Option<Rational>,
    /// 0 reads on the consumer thread, anything else spawns a reader thread.
    pub reader_threads: usize,
    /// Video queue bound after startup.
    pub video_capacity: usize,
    /// Ready queue (L2) bound. Only honoured with a reader thread.
    pub aux_capacity: usize,
    /// When false only auxiliary streams are produced.
    pub read_video: bool,
    /// Where to dump the frame ledger on close.
    pub frame_log: Option<PathBuf>,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            trims: Vec::new(),
            audio: Vec::new(),
            subtitles: Vec::new(),
            analyze_secs: None,
            forced_framerate: None,
            reader_threads: 1,
            video_capacity: DEFAULT_VIDEO_CAPACITY,
            aux_capacity: UNBOUNDED,
            read_video: true,
            frame_log: None,
        }
    }
}

/// One output sub-stream of an auxiliary track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubStream {
    /// Sub-stream number; 0 for an unsplit track.
    pub sub_stream: u32,
    /// Channels routed to this sub-stream, `None` for all of them.
    pub channel_mask: Option<u64>,
}

/// A selected auxiliary track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxTrack {
    /// Output track (sub-stream 0).
    pub key: TrackKey,
    /// Source stream.
    pub stream: StreamInfo,
    /// Output sub-streams.
    pub sub_streams: Vec<SubStream>,
    /// Start delay relative to the kept video, in stream ticks.
    pub delay: i64,
    /// A representative packet for decoder setup.
    pub sample: Option<Packet>,
}

impl AuxTrack {
    fn new(kind: StreamKind, number: usize, stream: StreamInfo, split: &[u64]) -> Self {
        let id = number as i32;
        let track_id = if kind == StreamKind::Subtitle { -id } else { id };
        let key = TrackKey::new(track_id, 0);
        let sub_streams = if kind == StreamKind::Audio {
            split_channels(key, stream.channels, split)
        } else {
            vec![SubStream {
                sub_stream: 0,
                channel_mask: None,
            }]
        };
        Self {
            key,
            stream,
            sub_streams,
            delay: 0,
            sample: None,
        }
    }

    /// Output key of one sub-stream.
    pub fn sub_key(&self, sub: &SubStream) -> TrackKey {
        TrackKey::new(self.key.track_id, sub.sub_stream)
    }
}

fn split_channels(key: TrackKey, channels: u16, split: &[u64]) -> Vec<SubStream> {
    let all = match channels {
        0 => u64::MAX,
        n if n >= 64 => u64::MAX,
        n => (1u64 << n) - 1,
    };
    let mut subs = Vec::new();
    for (i, &mask) in split.iter().enumerate() {
        let clipped = mask & all;
        if clipped == 0 {
            warn!(track = %key, mask = format!("{mask:#x}"), channels, "channel mask selects no channel, ignored");
            continue;
        }
        subs.push(SubStream {
            sub_stream: i as u32 + 1,
            channel_mask: Some(clipped),
        });
    }
    if subs.is_empty() {
        subs.push(SubStream {
            sub_stream: 0,
            channel_mask: None,
        });
    }
    subs
}

/// Video stream facts decided during startup.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct VideoInfo {
    /// Container stream index, `None` in audio-only mode without video.
    pub stream_index: Option<usize>,
    /// Codec, when decodable.
    pub codec: Option<VideoCodec>,
    /// Packet timebase (synthetic `1/fps` without video).
    pub timebase: Rational,
    /// Average framerate after estimation or override.
    pub avg_framerate: Rational,
    /// Expected frame duration in timebase ticks.
    pub expected_duration: i64,
    /// Timestamps are synthesized from frame indices.
    pub pts_all_invalid: bool,
    /// Packets skipped before the first keyframe.
    pub keyframe_offset: usize,
    /// No interlaced pictures seen during analysis.
    pub progressive: bool,
}

/// What the writer needs to place auxiliary packets on the output timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeline {
    /// Compiled trims.
    pub trims: TrimSet,
    /// Output framerate.
    pub framerate: Rational,
    /// Video packet timebase.
    pub video_timebase: Rational,
    /// Pts of the first video frame.
    pub video_start: i64,
}

impl Default for Timeline {
    fn default() -> Self {
        Self {
            trims: TrimSet::keep_all(),
            framerate: FALLBACK_FRAMERATE,
            video_timebase: FALLBACK_FRAMERATE.invert(),
            video_start: 0,
        }
    }
}

impl Timeline {
    /// Move a timestamp onto the trimmed output timeline: rebase it on the
    /// first video frame, then remove every trimmed-out frame before it.
    pub fn output_timestamp(&self, ts: i64, timebase: Rational) -> i64 {
        let start = Rational::rescale(self.video_start, self.video_timebase, timebase);
        self.trims.adjust_timestamp(ts - start, timebase, self.framerate)
    }
}

struct VideoTrack {
    info: StreamInfo,
    codec: Option<VideoCodec>,
    native_header: Vec<u8>,
    header: StreamHeader,
    converter: Option<AnnexBConverter>,
}

impl VideoTrack {
    /// Checks the codec and header for decoding.
    fn decodable(info: &StreamInfo) -> Result<Self> {
        let codec = VideoCodec::from_name(&info.codec)
            .ok_or_else(|| Error::UnsupportedCodec(info.codec.clone()))?;
        if codec.needs_header() && info.header.is_empty() {
            return Err(Error::MissingHeader(format!(
                "{} stream #{} has no codec header",
                info.codec, info.index
            )));
        }
        let converter = match codec {
            VideoCodec::H264 if is_length_prefixed(&info.header) => {
                Some(AnnexBConverter::from_avcc(&info.header)?)
            }
            VideoCodec::Hevc if is_length_prefixed(&info.header) => {
                Some(AnnexBConverter::from_hvcc(&info.header)?)
            }
            _ => None,
        };
        let header = match &converter {
            Some(conv) => StreamHeader::new(conv.header()),
            None => StreamHeader::new(info.header.clone()),
        };
        Ok(Self {
            info: info.clone(),
            codec: Some(codec),
            native_header: info.header.clone(),
            header,
            converter,
        })
    }

    /// Video only used as a clock; no decoding requirements.
    fn clock_only(info: &StreamInfo) -> Self {
        Self {
            info: info.clone(),
            codec: VideoCodec::from_name(&info.codec),
            native_header: info.header.clone(),
            header: StreamHeader::new(info.header.clone()),
            converter: None,
        }
    }
}

/// Paces synthetic ledger frames off an audio stream when there is no video.
struct AudioClock {
    stream_index: usize,
    timebase: Rational,
    frame_timebase: Rational,
    origin: Option<i64>,
    frames: i64,
}

impl AudioClock {
    /// Number of new frames covered by a packet at `pts`.
    fn advance(&mut self, pts: i64) -> std::ops::Range<i64> {
        let origin = *self.origin.get_or_insert(pts);
        let elapsed = Rational::rescale(pts - origin, self.timebase, self.frame_timebase);
        let start = self.frames;
        while elapsed > self.frames + 1 {
            self.frames += 1;
        }
        start..self.frames
    }
}

/// State owned by whichever thread is reading.
struct DemuxCore {
    source: Box<dyn PacketSource>,
    parser: Box<dyn PictureParser>,
    video: Option<VideoTrack>,
    video_timebase: Rational,
    feed_queue: bool,
    first_as_keyframe: bool,
    ledger: Ledger,
    trims: TrimSet,
    explicit_end: bool,
    aux: Vec<AuxStreamState>,
    staging: VecDeque<Packet>,
    video_queue: Arc<PacketQueue<Packet>>,
    aux_queue: Arc<PacketQueue<Packet>>,
    abort: Arc<AtomicBool>,
    armed: bool,
    eof: bool,
    seen_keyframe: bool,
    keyframe_offset: usize,
    expected_duration: i64,
    pts_all_invalid: bool,
    clock: Option<AudioClock>,
}

impl DemuxCore {
    /// Read one packet. Returns `false` once the input is exhausted, after
    /// finalization has run.
    fn get_sample(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        if self.overread_reached() {
            debug!(
                fixed = self.ledger.fixed_count(),
                "read past the last trim range, stopping"
            );
            self.finish()?;
            return Ok(false);
        }
        let Some(packet) = self.source.read_packet()? else {
            self.finish()?;
            return Ok(false);
        };
        let video_index = self.video.as_ref().map(|v| v.info.index);
        if Some(packet.stream_index) == video_index {
            self.handle_video(packet)?;
        } else if self.aux.iter().any(|s| s.stream_index == packet.stream_index) {
            self.stage_aux(packet)?;
        }
        Ok(true)
    }

    fn overread_reached(&self) -> bool {
        self.armed
            && self.trims.max_frame_index().is_some_and(|max| {
                self.ledger.fixed_count() as i64 >= max + TRIM_OVERREAD_FRAMES as i64
            })
    }

    fn handle_video(&mut self, packet: Packet) -> Result<()> {
        let Some(video) = self.video.as_mut() else {
            return Ok(());
        };
        let mut keyframe = packet.is_keyframe();
        if !self.seen_keyframe {
            if !keyframe && !self.first_as_keyframe {
                self.keyframe_offset += 1;
                trace!(pts = ?packet.pts, "skipping packet before first keyframe");
                return Ok(());
            }
            keyframe = true;
            self.seen_keyframe = true;
            debug!(offset = self.keyframe_offset, pts = ?packet.pts, "first keyframe");
        }

        let picture = if video.converter.is_some() {
            let native = video.native_header.clone();
            let header = video.header.scoped(native);
            self.parser.parse(&header, &packet)
        } else {
            self.parser.parse(video.header.as_bytes(), &packet)
        };
        let data = match &video.converter {
            Some(conv) => match conv.convert(&packet.data, keyframe) {
                Ok(converted) => Bytes::from(converted),
                Err(e) => {
                    warn!(pts = ?packet.pts, error = %e, "Annex-B conversion failed, passing packet through");
                    packet.data.clone()
                }
            },
            None => packet.data.clone(),
        };

        let record = FrameRecord::new(packet.pts, packet.dts, packet.duration, keyframe)
            .with_picture(picture.pic_struct, picture.repeat);
        self.ledger.append(record);
        self.ledger.fix(self.expected_duration);

        if self.feed_queue {
            let mut packet = packet;
            packet.data = data;
            packet.set_keyframe(keyframe);
            if self.video_queue.push(packet, &self.abort).is_err() {
                return Err(Error::aborted("video queue closed"));
            }
        }
        self.check_and_move()
    }

    fn stage_aux(&mut self, mut packet: Packet) -> Result<()> {
        if packet.pts.is_none() {
            packet.pts = packet.dts;
        }
        let Some(pts) = packet.pts else {
            trace!(stream = packet.stream_index, "aux packet without timestamps dropped");
            return Ok(());
        };
        let new_frames = match self.clock.as_mut() {
            Some(clock) if clock.stream_index == packet.stream_index => clock.advance(pts),
            _ => 0..0,
        };
        self.staging.push_back(packet);
        if new_frames.is_empty() {
            return Ok(());
        }
        for frame in new_frames {
            self.ledger
                .append(FrameRecord::new(Some(frame), Some(frame), 1, true));
        }
        self.ledger.fix(1);
        self.check_and_move()
    }

    /// Move every decidable staged packet to L2 or drop it.
    ///
    /// Stops early while L2 is full; the rest stays staged for the next call
    /// so the reader never waits on the auxiliary consumer.
    fn check_and_move(&mut self) -> Result<()> {
        if !self.armed {
            return Ok(());
        }
        let fixed = self.ledger.fixed_count();
        if fixed == 0 {
            return Ok(());
        }
        let Some(limit) = self
            .ledger
            .frame(fixed)
            .or_else(|| self.ledger.frame(fixed - 1))
            .map(FrameRecord::timestamp)
        else {
            return Ok(());
        };

        let vtb = self.video_timebase;
        let filter = SyncFilter::new(&self.ledger, &self.trims, vtb);
        while let Some(front) = self.staging.front() {
            if self.aux_queue.is_full() {
                trace!(staged = self.staging.len(), "aux queue full, keeping packets staged");
                break;
            }
            let (stream_index, pts, duration) =
                (front.stream_index, front.pts.unwrap_or(0), front.duration);
            let Some(state) = self.aux.iter_mut().find(|s| s.stream_index == stream_index) else {
                self.staging.pop_front();
                continue;
            };
            if Rational::compare_ts(pts, state.timebase, limit, vtb).is_gt() {
                break;
            }
            let accepted = filter.accept(PacketSpan::new(pts, duration), state);
            let track_id = state.key.track_id;
            let Some(mut packet) = self.staging.pop_front() else {
                break;
            };
            if accepted {
                packet.tag_track(track_id);
                if self.aux_queue.push(packet, &self.abort).is_err() {
                    return Err(Error::aborted("aux queue closed"));
                }
            }
        }
        Ok(())
    }

    /// Largest staged or ready auxiliary pts, in video ticks.
    fn max_aux_pts(&self) -> Option<i64> {
        let vtb = self.video_timebase;
        let to_video = |packet: &Packet| {
            let state = self.aux.iter().find(|s| s.stream_index == packet.stream_index)?;
            packet.pts.map(|pts| Rational::rescale(pts, state.timebase, vtb))
        };
        let staged = self.staging.iter().filter_map(to_video).max();
        let ready = self.aux_queue.inspect(|items| items.filter_map(to_video).max());
        staged.max(ready)
    }

    /// End of input: finalize the ledger, release the video queue's reorder
    /// floor and flush every decidable auxiliary packet.
    fn finish(&mut self) -> Result<()> {
        if self.eof {
            return Ok(());
        }
        self.eof = true;

        let mut last_pts = if self.pts_all_invalid || self.ledger.pts_status() == PtsStatus::AllInvalid
        {
            self.ledger.len() as i64 * self.ledger.expected_duration()
        } else {
            self.ledger.max_end_pts().unwrap_or(0)
        };
        if !self.explicit_end {
            if let Some(tail) = self.max_aux_pts() {
                last_pts = last_pts.max(tail);
            }
        }
        self.ledger
            .finalize(last_pts, self.source.container_duration());
        self.video_queue.set_keep_length(0);
        // Everything still staged has to reach L2 now.
        self.aux_queue.set_capacity(UNBOUNDED);

        let moved = if self.armed {
            let result = self.check_and_move();
            self.aux_queue.finish();
            result
        } else {
            Ok(())
        };
        self.video_queue.finish();

        info!(
            frames = self.ledger.len(),
            fixed = self.ledger.fixed_count(),
            terminal_pts = last_pts,
            unsent_aux = self.staging.len(),
            "demux finished"
        );
        moved
    }

    /// Reader thread body.
    fn run(&mut self) -> Result<()> {
        while !self.abort.load(Ordering::Acquire) {
            match self.get_sample() {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(Error::Aborted(_)) => break,
                Err(e) => {
                    error!(error = %e, "reader failed");
                    if let Err(finish_err) = self.finish() {
                        debug!(error = %finish_err, "finalization after reader failure");
                    }
                    self.aux_queue.finish();
                    self.video_queue.finish();
                    return Err(e);
                }
            }
        }
        debug!("reader aborted");
        Ok(())
    }
}

impl FrameSupply for DemuxCore {
    type Error = Error;

    fn read_frame(&mut self) -> Result<bool> {
        let before = self.ledger.len();
        while self.ledger.len() == before {
            if !self.get_sample()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    fn ledger_mut(&mut self) -> &mut Ledger {
        &mut self.ledger
    }

    fn keyframe_offset(&self) -> usize {
        self.keyframe_offset
    }
}

enum ReaderState {
    Inline(Box<DemuxCore>),
    Threaded(JoinHandle<(Box<DemuxCore>, Result<()>)>),
    Closed,
}

/// Demux reader handle owned by the consumer.
pub struct Demuxer {
    read_video: bool,
    video_info: VideoInfo,
    header: Vec<u8>,
    tracks: Vec<AuxTrack>,
    timeline: Timeline,
    estimate: Option<Estimate>,
    video_queue: Arc<PacketQueue<Packet>>,
    aux_queue: Arc<PacketQueue<Packet>>,
    abort: Arc<AtomicBool>,
    progress: Arc<LedgerProgress>,
    container_duration: Option<i64>,
    frame_log: Option<PathBuf>,
    state: ReaderState,
}

impl std::fmt::Debug for Demuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Demuxer")
            .field("video_info", &self.video_info)
            .field("tracks", &self.tracks.len())
            .field("video_queue", &self.video_queue)
            .field("aux_queue", &self.aux_queue)
            .finish()
    }
}

impl Demuxer {
    /// Open the input and run the startup phase.
    ///
    /// Setup problems (missing streams, undecodable video, bad trims, lost
    /// auxiliary tracks) are returned here; nothing is spawned in that case.
    pub fn open(
        source: Box<dyn PacketSource>,
        parser: Box<dyn PictureParser>,
        settings: ReaderSettings,
    ) -> Result<Self> {
        TrimSet::compile(&settings.trims, 0)?;
        let streams = source.streams().to_vec();
        let container_duration = source.container_duration();
        let tracks = select_tracks(&streams, &settings)?;

        let video = match streams.iter().find(|s| s.kind == StreamKind::Video) {
            Some(info) if settings.read_video => Some(VideoTrack::decodable(info)?),
            Some(info) => Some(VideoTrack::clock_only(info)),
            None if settings.read_video => {
                return Err(Error::StreamNotFound {
                    kind: StreamKind::Video,
                })
            }
            None => None,
        };
        if !settings.read_video && tracks.is_empty() {
            return Err(Error::invalid_input(
                "audio-only mode needs at least one audio or subtitle track",
            ));
        }

        let inline = settings.reader_threads == 0 || !settings.read_video;
        let aux_capacity = if inline { UNBOUNDED } else { settings.aux_capacity };
        let video_queue = Arc::new(PacketQueue::new("video", UNBOUNDED, REORDER_DEPTH));
        let aux_queue = Arc::new(PacketQueue::new("aux", UNBOUNDED, 0));
        let abort = Arc::new(AtomicBool::new(false));

        let clock_rate = match settings.forced_framerate {
            Some(rate) if rate.is_valid() => rate,
            _ => FALLBACK_FRAMERATE,
        };
        let video_timebase = video
            .as_ref()
            .map_or_else(|| clock_rate.invert(), |v| v.info.timebase);
        let clock = match &video {
            Some(_) => None,
            None => {
                if settings.forced_framerate.is_none() {
                    warn!(framerate = %clock_rate, "no video stream and no framerate given, using fallback");
                }
                let reference = tracks
                    .iter()
                    .find(|t| t.key.kind() == StreamKind::Audio)
                    .or_else(|| tracks.first());
                reference.map(|t| AudioClock {
                    stream_index: t.stream.index,
                    timebase: t.stream.timebase,
                    frame_timebase: video_timebase,
                    origin: None,
                    frames: 0,
                })
            }
        };

        let mut core = Box::new(DemuxCore {
            source,
            parser,
            video,
            video_timebase,
            feed_queue: settings.read_video,
            first_as_keyframe: !settings.read_video,
            ledger: Ledger::new(),
            trims: TrimSet::keep_all(),
            explicit_end: settings.trims.last().is_some_and(|r| r.end.is_some()),
            aux: tracks
                .iter()
                .map(|t| AuxStreamState::new(t.key, t.stream.index, t.stream.timebase))
                .collect(),
            staging: VecDeque::new(),
            video_queue: Arc::clone(&video_queue),
            aux_queue: Arc::clone(&aux_queue),
            abort: Arc::clone(&abort),
            armed: false,
            eof: false,
            seen_keyframe: false,
            keyframe_offset: 0,
            expected_duration: 1,
            pts_all_invalid: false,
            clock,
        });
        let progress = core.ledger.progress();

        let video_stream = core.video.as_ref().map(|v| v.info.clone());
        let (estimate, mut avg_framerate) = match &video_stream {
            Some(info) => {
                let input = EstimatorInput {
                    timebase: info.timebase,
                    decoder_rate: info.decoder_rate,
                    codec_rate: info.codec_rate,
                    ticks_per_frame: info.ticks_per_frame,
                    analyze_secs: settings.analyze_secs,
                };
                core.expected_duration = input.expected_frame_duration();
                let estimate = FramerateEstimator::new(input).run(&mut *core)?;
                let rate = estimate.avg_framerate;
                (Some(estimate), rate)
            }
            None => (None, clock_rate),
        };
        if let Some(forced) = settings.forced_framerate.filter(Rational::is_valid) {
            info!(estimated = %avg_framerate, forced = %forced, "framerate overridden");
            avg_framerate = forced;
        }

        let pts_all_invalid = estimate.as_ref().is_some_and(|e| e.pts_all_invalid);
        if pts_all_invalid {
            warn!("no usable video timestamps, using frame index based timestamps");
        }
        let keyframe_offset = estimate.as_ref().map_or(0, |e| e.keyframe_offset);
        core.pts_all_invalid = pts_all_invalid;
        if video_stream.is_some() {
            core.expected_duration =
                Rational::rescale(1, avg_framerate.invert(), video_timebase).max(1);
        }
        core.trims = TrimSet::compile(&settings.trims, keyframe_offset)?;

        let tracks = capture_first_samples(&mut core, tracks)?;

        core.armed = true;
        let expected = core.expected_duration;
        core.ledger.fix(expected);
        core.check_and_move()?;
        if core.eof {
            aux_queue.finish();
        }
        video_queue.set_capacity(settings.video_capacity);
        if !core.eof {
            aux_queue.set_capacity(aux_capacity);
        }

        let video_info = VideoInfo {
            stream_index: video_stream.as_ref().map(|s| s.index),
            codec: core.video.as_ref().and_then(|v| v.codec),
            timebase: video_timebase,
            avg_framerate,
            expected_duration: core.expected_duration,
            pts_all_invalid,
            keyframe_offset,
            progressive: core.ledger.is_progressive(),
        };
        let header = core
            .video
            .as_ref()
            .map(|v| v.header.as_bytes().to_vec())
            .unwrap_or_default();
        let timeline = Timeline {
            trims: core.trims.clone(),
            framerate: avg_framerate,
            video_timebase,
            video_start: core.ledger.frame(0).map_or(0, FrameRecord::timestamp),
        };

        info!(
            framerate = %avg_framerate,
            keyframe_offset,
            tracks = tracks.len(),
            trims = core.trims.ranges().len(),
            threaded = !inline,
            "demuxer ready"
        );

        let state = if inline || core.eof {
            ReaderState::Inline(core)
        } else {
            let handle = thread::Builder::new()
                .name("reelsync-reader".to_string())
                .spawn(move || {
                    let result = core.run();
                    (core, result)
                })?;
            ReaderState::Threaded(handle)
        };

        Ok(Self {
            read_video: settings.read_video,
            video_info,
            header,
            tracks,
            timeline,
            estimate,
            video_queue,
            aux_queue,
            abort,
            progress,
            container_duration,
            frame_log: settings.frame_log,
            state,
        })
    }

    /// Next video packet in demux order, `None` at end of stream.
    pub fn next_video_packet(&mut self) -> Result<Option<Packet>> {
        if !self.read_video {
            return Ok(None);
        }
        match &mut self.state {
            ReaderState::Inline(core) => loop {
                if let Some(packet) = self.video_queue.try_pop() {
                    return Ok(Some(packet));
                }
                if self.video_queue.is_finished() {
                    return Ok(None);
                }
                core.get_sample()?;
            },
            ReaderState::Threaded(_) => Ok(self.video_queue.pop(&self.abort)),
            ReaderState::Closed => Ok(None),
        }
    }

    /// Auxiliary packets accepted so far, tagged with their output track.
    ///
    /// In audio-only mode this also reads about one frame worth of input.
    pub fn take_aux_packets(&mut self) -> Result<Vec<Packet>> {
        if !self.read_video {
            if let ReaderState::Inline(core) = &mut self.state {
                core.read_frame()?;
            }
        }
        Ok(self.aux_queue.drain_ready())
    }

    /// True once every auxiliary packet has been handed out.
    pub fn aux_exhausted(&self) -> bool {
        self.aux_queue.is_finished() && self.aux_queue.is_empty()
    }

    /// Annex-B codec header of the video stream.
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Video stream facts decided at startup.
    pub fn video_info(&self) -> &VideoInfo {
        &self.video_info
    }

    /// Selected auxiliary tracks.
    pub fn aux_streams(&self) -> &[AuxTrack] {
        &self.tracks
    }

    /// Compiled trims.
    pub fn trims(&self) -> &TrimSet {
        &self.timeline.trims
    }

    /// Output timeline parameters for the writer.
    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Framerate estimation result, `None` without video.
    pub fn estimate(&self) -> Option<&Estimate> {
        self.estimate.as_ref()
    }

    /// Reader-side queue occupancy.
    pub fn queue_usage(&self) -> QueueUsage {
        QueueUsage {
            video_in: self.video_queue.len(),
            aux_in: self.aux_queue.len(),
            ..QueueUsage::default()
        }
    }

    /// Read progress against the container duration, if known.
    pub fn progress_percent(&self) -> Option<f64> {
        let micros = self.container_duration.filter(|&d| d > 0)?;
        let snapshot = self.progress.snapshot();
        if snapshot.finalized {
            return Some(100.0);
        }
        let secs = snapshot.fixed_span as f64 * self.video_info.timebase.as_f64();
        Some((secs * 1e8 / micros as f64).clamp(0.0, 100.0))
    }

    /// Stop reading and release the reader thread.
    ///
    /// Returns the reader's error, if it failed. Calling it twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let state = std::mem::replace(&mut self.state, ReaderState::Closed);
        let (core, result) = match state {
            ReaderState::Closed => return Ok(()),
            ReaderState::Inline(core) => (core, Ok(())),
            ReaderState::Threaded(handle) => {
                self.abort.store(true, Ordering::Release);
                self.video_queue.set_capacity(UNBOUNDED);
                self.aux_queue.set_capacity(UNBOUNDED);
                match handle.join() {
                    Ok(joined) => joined,
                    Err(_) => {
                        self.video_queue.close();
                        self.aux_queue.close();
                        return Err(Error::aborted("reader thread panicked"));
                    }
                }
            }
        };
        self.video_queue.close();
        self.aux_queue.close();
        if let Some(path) = &self.frame_log {
            write_frame_log(path, &core.ledger);
        }
        debug!(frames = core.ledger.len(), "demuxer closed");
        result
    }
}

impl Drop for Demuxer {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "demuxer closed with error");
        }
    }
}

fn write_frame_log(path: &Path, ledger: &Ledger) {
    let result = File::create(path).and_then(|file| {
        let mut out = BufWriter::new(file);
        ledger.write_log(&mut out)?;
        out.flush()
    });
    match result {
        Ok(()) => debug!(path = %path.display(), "frame log written"),
        Err(e) => warn!(path = %path.display(), error = %e, "failed to write frame log"),
    }
}

fn select_tracks(streams: &[StreamInfo], settings: &ReaderSettings) -> Result<Vec<AuxTrack>> {
    let audio: Vec<(TrackSelect, &[u64])> = settings
        .audio
        .iter()
        .map(|a| (a.track, a.split.as_slice()))
        .collect();
    let subtitles: Vec<(TrackSelect, &[u64])> =
        settings.subtitles.iter().map(|&s| (s, &[][..])).collect();

    let mut tracks = select_kind(streams, StreamKind::Audio, &audio)?;
    tracks.extend(select_kind(streams, StreamKind::Subtitle, &subtitles)?);
    Ok(tracks)
}

fn select_kind(
    streams: &[StreamInfo],
    kind: StreamKind,
    selectors: &[(TrackSelect, &[u64])],
) -> Result<Vec<AuxTrack>> {
    if selectors.is_empty() {
        return Ok(Vec::new());
    }
    let candidates: Vec<&StreamInfo> = streams.iter().filter(|s| s.kind == kind).collect();
    if candidates.is_empty() {
        return Err(Error::StreamNotFound { kind });
    }

    let mut chosen: Vec<Option<&[u64]>> = vec![None; candidates.len()];
    for &(select, split) in selectors {
        if let TrackSelect::Track(n) = select {
            let slot = (n as usize)
                .checked_sub(1)
                .and_then(|i| chosen.get_mut(i))
                .ok_or(Error::TrackNotFound { kind, track: n })?;
            slot.get_or_insert(split);
        }
    }
    for &(select, split) in selectors {
        if select == TrackSelect::All {
            for slot in chosen.iter_mut() {
                slot.get_or_insert(split);
            }
        }
    }

    Ok(chosen
        .into_iter()
        .enumerate()
        .filter_map(|(i, split)| {
            split.map(|split| AuxTrack::new(kind, i + 1, candidates[i].clone(), split))
        })
        .collect())
}

/// Keep a sample packet per audio track and compute its start delay. Audio
/// tracks with no staged packet are dropped.
fn capture_first_samples(core: &mut DemuxCore, tracks: Vec<AuxTrack>) -> Result<Vec<AuxTrack>> {
    if core.staging.is_empty() {
        return Ok(tracks);
    }
    let vtb = core.video_timebase;
    let mut kept = Vec::with_capacity(tracks.len());
    for mut track in tracks {
        if track.key.kind() != StreamKind::Audio {
            kept.push(track);
            continue;
        }
        let mut packets = core
            .staging
            .iter()
            .filter(|p| p.stream_index == track.stream.index);
        let Some(first) = packets.next() else {
            warn!(track = %track.key, stream = track.stream.index, "no packet found during preread, track dropped");
            continue;
        };
        track.sample = Some(packets.next().unwrap_or(first).clone());
        if !core.pts_all_invalid {
            let pts = first.pts.unwrap_or(0);
            track.delay = stream_delay(&core.ledger, &core.trims, vtb, pts, track.stream.timebase);
        }
        debug!(track = %track.key, delay = track.delay, timebase = %track.stream.timebase, "track delay");
        kept.push(track);
    }
    if kept.is_empty() {
        return Err(Error::NoAuxPackets);
    }

    core.aux.retain(|s| kept.iter().any(|t| t.stream.index == s.stream_index));
    for state in core.aux.iter_mut() {
        if let Some(track) = kept.iter().find(|t| t.stream.index == state.stream_index) {
            state.delay = track.delay;
        }
    }
    Ok(kept)
}

/// Time of kept video before the first packet at `pts`, in stream ticks.
fn stream_delay(ledger: &Ledger, trims: &TrimSet, vtb: Rational, pts: i64, tb: Rational) -> i64 {
    let filter = SyncFilter::new(ledger, trims, vtb);
    let index = filter.frame_index_for(pts, tb, 0);
    if index < 0 {
        return 0;
    }
    let mut delay = match ledger.frame(index as usize) {
        Some(frame) if trims.contains(index) => Rational::rescale(pts, tb, vtb) - frame.timestamp(),
        _ => 0,
    };
    delay += (0..index as usize)
        .filter(|&i| trims.contains(i as i64))
        .filter_map(|i| ledger.frame(i))
        .map(FrameRecord::total_duration)
        .sum::<i64>();
    Rational::rescale(delay, vtb, tb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemorySource, ProgressiveParser};
    use assert_matches::assert_matches;

    const MS: Rational = Rational::new(1, 1000);

    fn video_stream() -> StreamInfo {
        let mut info = StreamInfo::new(0, StreamKind::Video, "mpeg2video", MS);
        info.header = vec![0, 0, 1, 0xb3];
        info
    }

    fn audio_stream(index: usize) -> StreamInfo {
        let mut info = StreamInfo::new(index, StreamKind::Audio, "aac", MS);
        info.channels = 2;
        info
    }

    /// `frames` video frames of 40ms, each followed by two 20ms audio
    /// packets starting `audio_offset` ms later.
    fn interleaved(frames: i64, audio_offset: i64) -> Vec<Packet> {
        let mut packets = Vec::new();
        for i in 0..frames {
            packets.push(
                Packet::new(0, vec![i as u8])
                    .with_timing(Some(i * 40), Some(i * 40), 40)
                    .with_keyframe(i % 12 == 0),
            );
            for half in 0..2 {
                let pts = audio_offset + i * 40 + half * 20;
                packets.push(Packet::new(1, vec![0xa0]).with_timing(Some(pts), Some(pts), 20));
            }
        }
        packets
    }

    fn open(packets: Vec<Packet>, settings: ReaderSettings) -> Result<Demuxer> {
        let source = MemorySource::new(vec![video_stream(), audio_stream(1)], packets);
        Demuxer::open(Box::new(source), Box::new(ProgressiveParser), settings)
    }

    fn with_audio(settings: ReaderSettings) -> ReaderSettings {
        ReaderSettings {
            audio: vec![AudioSelect::default()],
            ..settings
        }
    }

    fn drain(demuxer: &mut Demuxer) -> (Vec<Packet>, Vec<Packet>) {
        let mut video = Vec::new();
        let mut aux = Vec::new();
        while let Some(packet) = demuxer.next_video_packet().unwrap() {
            video.push(packet);
            aux.extend(demuxer.take_aux_packets().unwrap());
        }
        aux.extend(demuxer.take_aux_packets().unwrap());
        (video, aux)
    }

    #[test]
    fn test_missing_video_is_setup_error() {
        let source = MemorySource::new(vec![audio_stream(0)], Vec::new());
        let err = Demuxer::open(Box::new(source), Box::new(ProgressiveParser), ReaderSettings::default())
            .unwrap_err();
        assert_matches!(err, Error::StreamNotFound { kind: StreamKind::Video });
    }

    #[test]
    fn test_unsupported_codec() {
        let info = StreamInfo::new(0, StreamKind::Video, "prores", MS);
        let source = MemorySource::new(vec![info], Vec::new());
        let err = Demuxer::open(Box::new(source), Box::new(ProgressiveParser), ReaderSettings::default())
            .unwrap_err();
        assert_matches!(err, Error::UnsupportedCodec(name) if name == "prores");
    }

    #[test]
    fn test_missing_header() {
        let info = StreamInfo::new(0, StreamKind::Video, "h264", MS);
        let source = MemorySource::new(vec![info], Vec::new());
        let err = Demuxer::open(Box::new(source), Box::new(ProgressiveParser), ReaderSettings::default())
            .unwrap_err();
        assert_matches!(err, Error::MissingHeader(_));
    }

    #[test]
    fn test_track_not_found() {
        let settings = ReaderSettings {
            audio: vec![AudioSelect {
                track: TrackSelect::Track(3),
                split: Vec::new(),
            }],
            ..ReaderSettings::default()
        };
        let err = open(interleaved(4, 0), settings).unwrap_err();
        assert_matches!(err, Error::TrackNotFound { kind: StreamKind::Audio, track: 3 });

        let settings = ReaderSettings {
            subtitles: vec![TrackSelect::All],
            ..ReaderSettings::default()
        };
        let err = open(interleaved(4, 0), settings).unwrap_err();
        assert_matches!(err, Error::StreamNotFound { kind: StreamKind::Subtitle });
    }

    #[test]
    fn test_inline_read_all_frames() {
        let settings = with_audio(ReaderSettings {
            reader_threads: 0,
            ..ReaderSettings::default()
        });
        let mut demuxer = open(interleaved(25, 0), settings).unwrap();
        assert_eq!(demuxer.video_info().avg_framerate, Rational::new(25, 1));
        assert_eq!(demuxer.video_info().expected_duration, 40);
        assert_eq!(demuxer.header(), &[0, 0, 1, 0xb3]);

        let (video, aux) = drain(&mut demuxer);
        let pts: Vec<i64> = video.iter().filter_map(|p| p.pts).collect();
        assert_eq!(pts, (0..25).map(|i| i * 40).collect::<Vec<_>>());
        assert_eq!(aux.len(), 50);
        assert!(aux.iter().all(|p| p.track_tag() == Some(1)));
        assert!(demuxer.aux_exhausted());
        demuxer.close().unwrap();
    }

    #[test]
    fn test_trim_keeps_matching_audio() {
        let settings = with_audio(ReaderSettings {
            reader_threads: 0,
            trims: vec![TrimRange::new(0, Some(10)).unwrap()],
            ..ReaderSettings::default()
        });
        let mut demuxer = open(interleaved(25, 0), settings).unwrap();
        let (video, aux) = drain(&mut demuxer);
        assert_eq!(video.len(), 25);
        let pts: Vec<i64> = aux.iter().filter_map(|p| p.pts).collect();
        assert_eq!(pts, (0..20).map(|i| i * 20).collect::<Vec<_>>());
    }

    #[test]
    fn test_keyframe_offset_counted() {
        let mut packets = interleaved(25, 0);
        let leading: Vec<Packet> = (0..3)
            .map(|_| Packet::new(0, vec![0xff]).with_timing(Some(-120), Some(-120), 40))
            .collect();
        packets.splice(0..0, leading);
        let settings = ReaderSettings {
            reader_threads: 0,
            trims: vec![TrimRange::new(0, Some(100)).unwrap(), TrimRange::open(200)],
            ..ReaderSettings::default()
        };
        let mut demuxer = open(packets, settings).unwrap();
        assert_eq!(demuxer.video_info().keyframe_offset, 3);
        assert_eq!(
            demuxer.trims().ranges(),
            &[TrimRange::new(0, Some(97)).unwrap(), TrimRange::open(197)]
        );
        let (video, _) = drain(&mut demuxer);
        assert_eq!(video.len(), 25);
        assert!(video[0].is_keyframe());
    }

    #[test]
    fn test_stream_delay() {
        let settings = with_audio(ReaderSettings {
            reader_threads: 0,
            ..ReaderSettings::default()
        });
        let demuxer = open(interleaved(25, 100), settings).unwrap();
        let track = &demuxer.aux_streams()[0];
        assert_eq!(track.delay, 100);
        assert_eq!(track.sample.as_ref().and_then(|p| p.pts), Some(120));

        let settings = with_audio(ReaderSettings {
            reader_threads: 0,
            trims: vec![TrimRange::open(2)],
            ..ReaderSettings::default()
        });
        let demuxer = open(interleaved(25, 100), settings).unwrap();
        assert_eq!(demuxer.aux_streams()[0].delay, 20);
    }

    #[test]
    fn test_threaded_reader_with_backpressure() {
        let settings = with_audio(ReaderSettings {
            reader_threads: 1,
            video_capacity: 4,
            ..ReaderSettings::default()
        });
        let mut demuxer = open(interleaved(300, 0), settings).unwrap();
        let (video, aux) = drain(&mut demuxer);
        assert_eq!(video.len(), 300);
        assert!(video.windows(2).all(|w| w[0].pts < w[1].pts));
        assert_eq!(aux.len(), 600);
        demuxer.close().unwrap();
        demuxer.close().unwrap();
    }

    #[test]
    fn test_threaded_reader_with_bounded_aux_queue() {
        let settings = with_audio(ReaderSettings {
            reader_threads: 1,
            video_capacity: 4,
            aux_capacity: 8,
            ..ReaderSettings::default()
        });
        let mut demuxer = open(interleaved(300, 0), settings).unwrap();
        let (video, aux) = drain(&mut demuxer);
        assert_eq!(video.len(), 300);
        let pts: Vec<i64> = aux.iter().filter_map(|p| p.pts).collect();
        assert_eq!(pts, (0..600).map(|i| i * 20).collect::<Vec<_>>());
        demuxer.close().unwrap();
    }

    #[test]
    fn test_steady_state_keeps_frame_aligned_audio() {
        for reader_threads in [0, 1] {
            let settings = with_audio(ReaderSettings {
                reader_threads,
                ..ReaderSettings::default()
            });
            let mut demuxer = open(interleaved(200, 0), settings).unwrap();
            let (video, aux) = drain(&mut demuxer);
            assert_eq!(video.len(), 200);
            let pts: Vec<i64> = aux.iter().filter_map(|p| p.pts).collect();
            assert_eq!(
                pts,
                (0..400).map(|i| i * 20).collect::<Vec<_>>(),
                "reader_threads {reader_threads}"
            );
            demuxer.close().unwrap();
        }
    }

    #[test]
    fn test_close_early_joins_reader() {
        let settings = with_audio(ReaderSettings {
            reader_threads: 1,
            video_capacity: 2,
            ..ReaderSettings::default()
        });
        let mut demuxer = open(interleaved(400, 0), settings).unwrap();
        assert!(demuxer.next_video_packet().unwrap().is_some());
        demuxer.close().unwrap();
        assert_eq!(demuxer.next_video_packet().unwrap(), None);
    }

    #[test]
    fn test_audio_only_without_video() {
        let packets: Vec<Packet> = (0..50)
            .map(|i| Packet::new(0, vec![1]).with_timing(Some(i * 20), Some(i * 20), 20))
            .collect();
        let source = MemorySource::new(vec![audio_stream(0)], packets);
        let settings = with_audio(ReaderSettings {
            read_video: false,
            forced_framerate: Some(Rational::new(25, 1)),
            ..ReaderSettings::default()
        });
        let mut demuxer =
            Demuxer::open(Box::new(source), Box::new(ProgressiveParser), settings).unwrap();
        assert_eq!(demuxer.video_info().stream_index, None);
        assert_eq!(demuxer.next_video_packet().unwrap(), None);

        let mut aux = Vec::new();
        while !demuxer.aux_exhausted() {
            aux.extend(demuxer.take_aux_packets().unwrap());
        }
        assert_eq!(aux.len(), 50);
    }

    #[test]
    fn test_frame_log_written_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.csv");
        let settings = ReaderSettings {
            reader_threads: 0,
            frame_log: Some(path.clone()),
            ..ReaderSettings::default()
        };
        let mut demuxer = open(interleaved(10, 0), settings).unwrap();
        drain(&mut demuxer);
        demuxer.close().unwrap();
        let log = std::fs::read_to_string(path).unwrap();
        assert!(log.contains("poc,pts,dts"));
        assert!(log.contains("# terminal pts=400"));
    }

    #[test]
    fn test_track_select_parse() {
        assert_eq!("all".parse::<TrackSelect>().unwrap(), TrackSelect::All);
        assert_eq!("2".parse::<TrackSelect>().unwrap(), TrackSelect::Track(2));
        assert!("0".parse::<TrackSelect>().is_err());
        assert!("first".parse::<TrackSelect>().is_err());
    }

    #[test]
    fn test_split_channels_clipped() {
        let key = TrackKey::new(1, 0);
        let subs = split_channels(key, 2, &[0x1, 0x6, 0x8]);
        assert_eq!(
            subs,
            vec![
                SubStream { sub_stream: 1, channel_mask: Some(0x1) },
                SubStream { sub_stream: 2, channel_mask: Some(0x2) },
            ]
        );
        let subs = split_channels(key, 2, &[0x8]);
        assert_eq!(subs, vec![SubStream { sub_stream: 0, channel_mask: None }]);
    }

    #[test]
    fn test_timeline_output_timestamp() {
        let timeline = Timeline {
            trims: TrimSet::compile(&[TrimRange::new(0, Some(10)).unwrap(), TrimRange::open(20)], 0)
                .unwrap(),
            framerate: Rational::new(25, 1),
            video_timebase: MS,
            video_start: 1000,
        };
        assert_eq!(timeline.output_timestamp(1200, MS), 200);
        assert_eq!(timeline.output_timestamp(1000 + 21 * 40, MS), 11 * 40);
    }
}
