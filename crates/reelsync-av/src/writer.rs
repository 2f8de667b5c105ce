//! Mux writer: process, encode and output stages.
//!
//! Every item (video bitstream or auxiliary packet) goes through the same
//! stage chain, so FIFO order between them is kept end to end:
//!
//! ```text
//! write_*() --> [process] --> [encode] --> [output] --> PacketSink
//! ```
//!
//! A thread boundary, an SPSC [`PacketQueue`] of `stage_capacity` items,
//! sits before `process` when `aux_threads >= 1`, before `encode` when
//! `aux_threads == 2` and before `output` when `output_thread` is set.
//! Stages without a boundary in front of them run on the upstream thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use parking_lot::Mutex;
use reelsync_common::{Rational, StreamKind, TrackKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::codec::Bitstream;
use crate::queue::{PacketQueue, QueueUsage, UNBOUNDED};
use crate::reader::{AuxTrack, Timeline, VideoInfo};
use crate::{Error, Packet, Result};

/// Default bound of each stage queue.
pub const DEFAULT_STAGE_CAPACITY: usize = 64;

/// Writer threading configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterSettings {
    /// Run the output stage on its own thread.
    pub output_thread: bool,
    /// Threads for auxiliary processing: 0, 1 (process + encode) or 2.
    pub aux_threads: usize,
    /// Bound of each stage queue.
    pub stage_capacity: usize,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            output_thread: true,
            aux_threads: 0,
            stage_capacity: DEFAULT_STAGE_CAPACITY,
        }
    }
}

impl WriterSettings {
    /// Reject combinations the stage layout cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.aux_threads > 2 {
            return Err(Error::invalid_input(format!(
                "aux_threads must be 0, 1 or 2, got {}",
                self.aux_threads
            )));
        }
        if self.aux_threads > 0 && !self.output_thread {
            return Err(Error::invalid_input(
                "aux_threads requires output_thread to be enabled",
            ));
        }
        if self.stage_capacity == 0 {
            return Err(Error::invalid_input("stage_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// One output auxiliary sub-stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTrack {
    /// Output key.
    pub key: TrackKey,
    /// Stream kind.
    pub kind: StreamKind,
    /// Source codec name.
    pub codec: String,
    /// Packet timebase.
    pub timebase: Rational,
    /// Channels of the source routed here, `None` for all.
    pub channel_mask: Option<u64>,
    /// Start delay in `timebase` ticks.
    pub delay: i64,
    /// Decoded and re-encoded instead of copied.
    pub transcode: bool,
}

/// Expand selected tracks into output sub-streams.
pub fn output_tracks(tracks: &[AuxTrack]) -> Vec<OutputTrack> {
    tracks
        .iter()
        .flat_map(|track| {
            track.sub_streams.iter().map(move |sub| OutputTrack {
                key: track.sub_key(sub),
                kind: track.key.kind(),
                codec: track.stream.codec.clone(),
                timebase: track.stream.timebase,
                channel_mask: sub.channel_mask,
                delay: track.delay,
                transcode: sub.channel_mask.is_some(),
            })
        })
        .collect()
}

/// Everything the sink needs to write the file header.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MuxHeader {
    /// Video stream facts, `None` for audio-only output.
    pub video: Option<VideoInfo>,
    /// Codec header of the output video.
    #[serde(with = "crate::source::hex_bytes")]
    pub video_header: Vec<u8>,
    /// Auxiliary output sub-streams.
    pub tracks: Vec<OutputTrack>,
}

/// A decoded chunk of auxiliary data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxFrame {
    /// Source stream index.
    pub stream_index: usize,
    /// Presentation timestamp in the stream timebase.
    pub pts: i64,
    /// Duration in the stream timebase.
    pub duration: i64,
    /// Decoded payload.
    pub data: Bytes,
}

/// Decodes auxiliary packets for transcoded tracks.
pub trait AuxDecoder: Send {
    /// Decode one packet for sub-stream `key`, keeping `channel_mask`.
    fn decode(&mut self, key: TrackKey, packet: &Packet, channel_mask: Option<u64>) -> Result<Vec<AuxFrame>>;

    /// Drain buffered frames of `key`.
    fn flush(&mut self, key: TrackKey) -> Result<Vec<AuxFrame>>;
}

/// Encodes decoded auxiliary frames.
pub trait AuxEncoder: Send {
    /// Encode one frame of sub-stream `key`.
    fn encode(&mut self, key: TrackKey, frame: AuxFrame) -> Result<Vec<Packet>>;

    /// Drain buffered packets of `key`.
    fn flush(&mut self, key: TrackKey) -> Result<Vec<Packet>>;
}

/// Decoder and encoder that only repackage data.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCodec;

impl AuxDecoder for PassthroughCodec {
    fn decode(&mut self, _key: TrackKey, packet: &Packet, _channel_mask: Option<u64>) -> Result<Vec<AuxFrame>> {
        Ok(vec![AuxFrame {
            stream_index: packet.stream_index,
            pts: packet.timestamp().unwrap_or(0),
            duration: packet.duration,
            data: packet.data.clone(),
        }])
    }

    fn flush(&mut self, _key: TrackKey) -> Result<Vec<AuxFrame>> {
        Ok(Vec::new())
    }
}

impl AuxEncoder for PassthroughCodec {
    fn encode(&mut self, _key: TrackKey, frame: AuxFrame) -> Result<Vec<Packet>> {
        let packet = Packet::new(frame.stream_index, frame.data)
            .with_timing(Some(frame.pts), Some(frame.pts), frame.duration)
            .with_keyframe(true);
        Ok(vec![packet])
    }

    fn flush(&mut self, _key: TrackKey) -> Result<Vec<Packet>> {
        Ok(Vec::new())
    }
}

/// Writes the output container.
pub trait PacketSink: Send {
    /// Write the file header. Called once, before any packet.
    fn write_header(&mut self, header: &MuxHeader) -> Result<()>;

    /// Write one coded video frame.
    fn write_video(&mut self, bitstream: &Bitstream) -> Result<()>;

    /// Write one auxiliary packet with output timestamps.
    fn write_packet(&mut self, key: TrackKey, packet: &Packet) -> Result<()>;

    /// Write the trailer and flush.
    fn finish(&mut self) -> Result<()>;
}

/// What a [`MemorySink`] saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// Header with this many auxiliary tracks.
    Header { tracks: usize },
    /// Video frame.
    Video { timestamp: i64, size: usize },
    /// Auxiliary packet.
    Packet { key: TrackKey, pts: Option<i64>, size: usize },
    /// Trailer.
    Finish,
}

/// Sink recording events in memory; clones share the log.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<SinkEvent>>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far.
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }
}

impl PacketSink for MemorySink {
    fn write_header(&mut self, header: &MuxHeader) -> Result<()> {
        self.events.lock().push(SinkEvent::Header {
            tracks: header.tracks.len(),
        });
        Ok(())
    }

    fn write_video(&mut self, bitstream: &Bitstream) -> Result<()> {
        self.events.lock().push(SinkEvent::Video {
            timestamp: bitstream.timestamp,
            size: bitstream.data.len(),
        });
        Ok(())
    }

    fn write_packet(&mut self, key: TrackKey, packet: &Packet) -> Result<()> {
        self.events.lock().push(SinkEvent::Packet {
            key,
            pts: packet.pts,
            size: packet.size(),
        });
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.events.lock().push(SinkEvent::Finish);
        Ok(())
    }
}

/// Item flowing through the stage chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxItem {
    /// Coded video frame.
    Video(Bitstream),
    /// Coded auxiliary packet for a track (sub-stream 0) or sub-stream.
    AuxPacket { key: TrackKey, packet: Packet },
    /// Decoded auxiliary frame of a sub-stream.
    AuxFrame { key: TrackKey, frame: AuxFrame },
}

/// Totals reported by [`Muxer::finish`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MuxStats {
    /// Video frames written.
    pub video_frames: u64,
    /// Auxiliary packets written.
    pub aux_packets: u64,
    /// Payload bytes written.
    pub bytes: u64,
}

trait Stage: Send {
    fn name(&self) -> &'static str;
    fn handle(&mut self, item: MuxItem, out: &mut Vec<MuxItem>) -> Result<()>;
    fn flush(&mut self, out: &mut Vec<MuxItem>) -> Result<()>;
}

struct Route {
    key: TrackKey,
    channel_mask: Option<u64>,
    transcode: bool,
}

/// Fans track packets out to their sub-streams; decodes transcoded ones.
struct ProcessStage {
    routes: HashMap<i32, Vec<Route>>,
    decoder: Option<Box<dyn AuxDecoder>>,
}

impl Stage for ProcessStage {
    fn name(&self) -> &'static str {
        "process"
    }

    fn handle(&mut self, item: MuxItem, out: &mut Vec<MuxItem>) -> Result<()> {
        let MuxItem::AuxPacket { key, packet } = item else {
            out.push(item);
            return Ok(());
        };
        let Some(routes) = self.routes.get(&key.track_id) else {
            trace!(track = %key, "packet for unknown track dropped");
            return Ok(());
        };
        for route in routes {
            if !route.transcode {
                out.push(MuxItem::AuxPacket {
                    key: route.key,
                    packet: packet.clone(),
                });
                continue;
            }
            let decoder = self
                .decoder
                .as_mut()
                .ok_or_else(|| Error::session(format!("no decoder for {}", route.key)))?;
            for frame in decoder.decode(route.key, &packet, route.channel_mask)? {
                out.push(MuxItem::AuxFrame {
                    key: route.key,
                    frame,
                });
            }
        }
        Ok(())
    }

    fn flush(&mut self, out: &mut Vec<MuxItem>) -> Result<()> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(());
        };
        for route in self.routes.values().flatten().filter(|r| r.transcode) {
            for frame in decoder.flush(route.key)? {
                out.push(MuxItem::AuxFrame {
                    key: route.key,
                    frame,
                });
            }
        }
        Ok(())
    }
}

/// Encodes decoded auxiliary frames back into packets.
struct EncodeStage {
    keys: Vec<TrackKey>,
    encoder: Option<Box<dyn AuxEncoder>>,
}

impl Stage for EncodeStage {
    fn name(&self) -> &'static str {
        "encode"
    }

    fn handle(&mut self, item: MuxItem, out: &mut Vec<MuxItem>) -> Result<()> {
        let MuxItem::AuxFrame { key, frame } = item else {
            out.push(item);
            return Ok(());
        };
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| Error::session(format!("no encoder for {key}")))?;
        for packet in encoder.encode(key, frame)? {
            out.push(MuxItem::AuxPacket { key, packet });
        }
        Ok(())
    }

    fn flush(&mut self, out: &mut Vec<MuxItem>) -> Result<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };
        for &key in &self.keys {
            for packet in encoder.flush(key)? {
                out.push(MuxItem::AuxPacket { key, packet });
            }
        }
        Ok(())
    }
}

/// Writes to the sink; holds auxiliary packets back until the header and
/// first video frame are out.
struct OutputStage {
    sink: Box<dyn PacketSink>,
    header: MuxHeader,
    timebases: HashMap<TrackKey, Rational>,
    timeline: Timeline,
    header_written: bool,
    expect_video: bool,
    pending: Vec<(TrackKey, Packet)>,
    stats: Arc<Mutex<MuxStats>>,
}

impl OutputStage {
    fn write_header(&mut self) -> Result<()> {
        if !self.header_written {
            self.sink.write_header(&self.header)?;
            self.header_written = true;
            debug!(tracks = self.header.tracks.len(), "output header written");
        }
        Ok(())
    }

    fn write_aux(&mut self, key: TrackKey, mut packet: Packet) -> Result<()> {
        let Some(&timebase) = self.timebases.get(&key) else {
            trace!(track = %key, "packet for unknown output track dropped");
            return Ok(());
        };
        if let Some(ts) = packet.timestamp() {
            let shift = ts - self.timeline.output_timestamp(ts, timebase);
            packet.pts = packet.pts.map(|pts| pts - shift);
            packet.dts = packet.dts.map(|dts| dts - shift);
        }
        self.sink.write_packet(key, &packet)?;
        let mut stats = self.stats.lock();
        stats.aux_packets += 1;
        stats.bytes += packet.size() as u64;
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<()> {
        for (key, packet) in std::mem::take(&mut self.pending) {
            self.write_aux(key, packet)?;
        }
        Ok(())
    }
}

impl Stage for OutputStage {
    fn name(&self) -> &'static str {
        "output"
    }

    fn handle(&mut self, item: MuxItem, _out: &mut Vec<MuxItem>) -> Result<()> {
        match item {
            MuxItem::Video(bitstream) => {
                self.write_header()?;
                self.sink.write_video(&bitstream)?;
                {
                    let mut stats = self.stats.lock();
                    stats.video_frames += 1;
                    stats.bytes += bitstream.data.len() as u64;
                }
                self.flush_pending()
            }
            MuxItem::AuxPacket { key, packet } => {
                let video_written = self.stats.lock().video_frames > 0;
                if self.expect_video && !video_written {
                    self.pending.push((key, packet));
                    return Ok(());
                }
                self.write_header()?;
                self.write_aux(key, packet)
            }
            MuxItem::AuxFrame { key, .. } => {
                warn!(track = %key, "decoded frame reached the output stage, dropped");
                Ok(())
            }
        }
    }

    fn flush(&mut self, _out: &mut Vec<MuxItem>) -> Result<()> {
        if !self.pending.is_empty() {
            warn!(
                packets = self.pending.len(),
                "no video written, flushing buffered auxiliary packets"
            );
        }
        self.write_header()?;
        self.flush_pending()?;
        self.sink.finish()
    }
}

/// Stages run back to back on one thread.
#[derive(Default)]
struct Segment {
    stages: Vec<Box<dyn Stage>>,
}

impl Segment {
    fn run(&mut self, item: MuxItem) -> Result<Vec<MuxItem>> {
        let mut items = vec![item];
        for stage in &mut self.stages {
            let mut next = Vec::with_capacity(items.len());
            for item in items {
                stage.handle(item, &mut next)?;
            }
            items = next;
        }
        Ok(items)
    }

    fn flush(&mut self) -> Result<Vec<MuxItem>> {
        let mut items = Vec::new();
        for stage in &mut self.stages {
            let mut next = Vec::with_capacity(items.len());
            for item in items {
                stage.handle(item, &mut next)?;
            }
            stage.flush(&mut next)?;
            items = next;
        }
        Ok(items)
    }

    fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

fn forward(items: Vec<MuxItem>, to: Option<&PacketQueue<MuxItem>>, abort: &AtomicBool) -> Result<()> {
    let Some(queue) = to else {
        return Ok(());
    };
    for item in items {
        if queue.push(item, abort).is_err() {
            return Err(Error::aborted(format!("{} queue closed", queue.name())));
        }
    }
    Ok(())
}

struct Worker {
    input: Arc<PacketQueue<MuxItem>>,
    handle: JoinHandle<Result<()>>,
}

fn spawn_segment(
    mut segment: Segment,
    input: Arc<PacketQueue<MuxItem>>,
    output: Option<Arc<PacketQueue<MuxItem>>>,
    abort: Arc<AtomicBool>,
) -> Result<JoinHandle<Result<()>>> {
    let name = format!("reelsync-mux-{}", segment.names().join("-"));
    let handle = thread::Builder::new().name(name).spawn(move || {
        let result = (|| {
            while let Some(item) = input.pop(&abort) {
                let items = segment.run(item)?;
                forward(items, output.as_deref(), &abort)?;
            }
            if abort.load(Ordering::Acquire) {
                return Ok(());
            }
            let items = segment.flush()?;
            forward(items, output.as_deref(), &abort)
        })();
        if let Some(next) = &output {
            next.finish();
        }
        match result {
            Err(Error::Aborted(_)) => {
                // Downstream is gone; stop accepting so upstream notices too.
                input.close();
                Ok(())
            }
            Err(e) => {
                error!(stages = ?segment.names(), error = %e, "writer stage failed");
                input.close();
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    })?;
    Ok(handle)
}

/// Optional auxiliary decoder and encoder for transcoded tracks.
#[derive(Default)]
pub struct AuxCodecs {
    /// Decoder used by the process stage.
    pub decoder: Option<Box<dyn AuxDecoder>>,
    /// Encoder used by the encode stage.
    pub encoder: Option<Box<dyn AuxEncoder>>,
}

impl AuxCodecs {
    /// Passthrough decoder and encoder.
    pub fn passthrough() -> Self {
        Self {
            decoder: Some(Box::new(PassthroughCodec)),
            encoder: Some(Box::new(PassthroughCodec)),
        }
    }
}

/// Mux writer handle.
pub struct Muxer {
    head: Segment,
    head_out: Option<Arc<PacketQueue<MuxItem>>>,
    workers: Vec<Worker>,
    /// Boundary queues, each tagged with the stage it feeds.
    boundaries: Vec<(&'static str, Arc<PacketQueue<MuxItem>>)>,
    abort: Arc<AtomicBool>,
    stats: Arc<Mutex<MuxStats>>,
    done: bool,
}

impl std::fmt::Debug for Muxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Muxer")
            .field("inline", &self.head.names())
            .field("workers", &self.workers.len())
            .field("done", &self.done)
            .finish()
    }
}

impl Muxer {
    /// Build the stage chain and spawn its threads.
    pub fn new(
        sink: Box<dyn PacketSink>,
        codecs: AuxCodecs,
        header: MuxHeader,
        timeline: Timeline,
        settings: WriterSettings,
    ) -> Result<Self> {
        settings.validate()?;
        if header.tracks.iter().any(|t| t.transcode)
            && (codecs.decoder.is_none() || codecs.encoder.is_none())
        {
            return Err(Error::session("transcoded tracks need an auxiliary decoder and encoder"));
        }

        let mut routes: HashMap<i32, Vec<Route>> = HashMap::new();
        for track in &header.tracks {
            routes.entry(track.key.track_id).or_default().push(Route {
                key: track.key,
                channel_mask: track.channel_mask,
                transcode: track.transcode,
            });
        }
        let transcoded: Vec<TrackKey> = header
            .tracks
            .iter()
            .filter(|t| t.transcode)
            .map(|t| t.key)
            .collect();
        let timebases = header.tracks.iter().map(|t| (t.key, t.timebase)).collect();
        let stats = Arc::new(Mutex::new(MuxStats::default()));

        let stages: Vec<(bool, Box<dyn Stage>)> = vec![
            (
                settings.aux_threads >= 1,
                Box::new(ProcessStage {
                    routes,
                    decoder: codecs.decoder,
                }),
            ),
            (
                settings.aux_threads == 2,
                Box::new(EncodeStage {
                    keys: transcoded,
                    encoder: codecs.encoder,
                }),
            ),
            (
                settings.output_thread,
                Box::new(OutputStage {
                    sink,
                    expect_video: header.video.is_some(),
                    header,
                    timebases,
                    timeline,
                    header_written: false,
                    pending: Vec::new(),
                    stats: Arc::clone(&stats),
                }),
            ),
        ];

        let mut segments: Vec<(Option<(&'static str, Arc<PacketQueue<MuxItem>>)>, Segment)> =
            vec![(None, Segment::default())];
        for (boundary, stage) in stages {
            if boundary {
                let queue = Arc::new(PacketQueue::new(stage.name(), settings.stage_capacity, 0));
                segments.push((Some((stage.name(), queue)), Segment::default()));
            }
            if let Some((_, segment)) = segments.last_mut() {
                segment.stages.push(stage);
            }
        }

        let abort = Arc::new(AtomicBool::new(false));
        let boundaries: Vec<(&'static str, Arc<PacketQueue<MuxItem>>)> =
            segments.iter().filter_map(|(b, _)| b.clone()).collect();

        let mut segments = segments.into_iter();
        let head = segments.next().map(|(_, s)| s).unwrap_or_default();
        let head_out = boundaries.first().map(|(_, q)| Arc::clone(q));
        let mut workers = Vec::new();
        for (i, (boundary, segment)) in segments.enumerate() {
            let Some((_, input)) = boundary else {
                continue;
            };
            let output = boundaries.get(i + 1).map(|(_, q)| Arc::clone(q));
            let handle = spawn_segment(segment, Arc::clone(&input), output, Arc::clone(&abort))?;
            workers.push(Worker { input, handle });
        }

        info!(
            inline = ?head.names(),
            threads = workers.len(),
            stage_capacity = settings.stage_capacity,
            "muxer ready"
        );
        Ok(Self {
            head,
            head_out,
            workers,
            boundaries,
            abort,
            stats,
            done: false,
        })
    }

    fn push(&mut self, item: MuxItem) -> Result<()> {
        if self.done {
            return Err(Error::aborted("muxer already finished"));
        }
        let items = self.head.run(item)?;
        match forward(items, self.head_out.as_deref(), &self.abort) {
            Err(Error::Aborted(msg)) => {
                warn!(reason = %msg, "writer stage stopped, shutting down");
                Err(self.shutdown().err().unwrap_or(Error::Aborted(msg)))
            }
            other => other,
        }
    }

    /// Queue one coded video frame.
    pub fn write_video(&mut self, bitstream: Bitstream) -> Result<()> {
        self.push(MuxItem::Video(bitstream))
    }

    /// Queue auxiliary packets tagged by the reader.
    pub fn write_aux(&mut self, packets: Vec<Packet>) -> Result<()> {
        for packet in packets {
            let Some(track_id) = packet.track_tag() else {
                warn!(stream = packet.stream_index, "untagged auxiliary packet dropped");
                continue;
            };
            self.push(MuxItem::AuxPacket {
                key: TrackKey::new(track_id, 0),
                packet,
            })?;
        }
        Ok(())
    }

    /// Occupancy of the stage queues.
    pub fn queue_usage(&self) -> QueueUsage {
        let mut usage = QueueUsage::default();
        for (stage, queue) in &self.boundaries {
            match *stage {
                "process" => usage.aux_process = queue.len(),
                "encode" => usage.aux_encode = queue.len(),
                _ => {
                    let video = queue.inspect(|items| {
                        items.filter(|i| matches!(i, MuxItem::Video(_))).count()
                    });
                    usage.video_out = video;
                    usage.aux_out = queue.len().saturating_sub(video);
                }
            }
        }
        usage
    }

    /// Flush every stage in order, join the threads and report totals.
    pub fn finish(&mut self) -> Result<MuxStats> {
        if self.done {
            return Ok(self.stats.lock().clone());
        }
        self.done = true;
        let flushed = self
            .head
            .flush()
            .and_then(|items| forward(items, self.head_out.as_deref(), &self.abort));
        if let Some(queue) = &self.head_out {
            queue.finish();
        }
        let joined = self.join();
        if let Err(Error::Aborted(_)) = flushed {
            joined?;
            flushed?;
        } else {
            flushed?;
            joined?;
        }
        let stats = self.stats.lock().clone();
        info!(
            video_frames = stats.video_frames,
            aux_packets = stats.aux_packets,
            bytes = stats.bytes,
            "muxer finished"
        );
        Ok(stats)
    }

    /// Stop all stages without flushing.
    pub fn abort(&mut self) {
        if let Err(e) = self.shutdown() {
            debug!(error = %e, "writer stage error during abort");
        }
    }

    /// Stop and join every stage, returning the first stage failure.
    fn shutdown(&mut self) -> Result<()> {
        if self.done && self.workers.is_empty() {
            return Ok(());
        }
        self.done = true;
        self.abort.store(true, Ordering::Release);
        for (_, queue) in &self.boundaries {
            queue.set_capacity(UNBOUNDED);
            queue.set_keep_length(0);
        }
        let joined = self.join();
        for (_, queue) in &self.boundaries {
            queue.close();
        }
        joined
    }

    fn join(&mut self) -> Result<()> {
        let mut first_error = None;
        for worker in self.workers.drain(..) {
            let result = match worker.handle.join() {
                Ok(result) => result,
                Err(_) => Err(Error::aborted("writer thread panicked")),
            };
            if let Err(e) = result {
                worker.input.close();
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Muxer {
    fn drop(&mut self) {
        if !self.done || !self.workers.is_empty() {
            self.abort();
        }
    }
}
