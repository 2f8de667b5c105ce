//! Transcode driver: reader -> codec session -> writer.
//!
//! The driver owns the consumer side of both pipelines. Each iteration it
//! pulls one video packet, feeds the session, hands finished frames inside
//! the trims to the writer, then moves every auxiliary packet the reader has
//! accepted so far. Errors abort the writer and close the reader before they
//! are returned.

use std::path::Path;

use anyhow::{Context, Result};
use reelsync_av::writer::output_tracks;
use reelsync_av::{
    AuxCodecs, AvSyncMode, CopySession, Demuxer, HwSession, MuxHeader, MuxStats, Muxer,
    PacketLogSink, PacketLogSource, ProgressiveParser, QueueUsage, Timeline,
};
use reelsync_common::Rational;
use reelsync_media::estimate::DurationBucket;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Frames between two queue telemetry log lines.
const TELEMETRY_INTERVAL: u64 = 256;

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct TranscodeReport {
    pub framerate: Rational,
    pub keyframe_offset: usize,
    pub tracks: usize,
    pub video_frames: u64,
    pub aux_packets: u64,
    pub bytes: u64,
}

/// One selected auxiliary sub-stream, as reported by `analyze`.
#[derive(Debug, Clone, Serialize)]
pub struct TrackSummary {
    pub track: String,
    pub codec: String,
    pub delay: i64,
    pub channel_mask: Option<u64>,
}

/// Startup-phase facts about an input.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeReport {
    pub framerate: Rational,
    pub timebase: Rational,
    pub frame_duration: i64,
    pub keyframe_offset: usize,
    pub pts_all_invalid: bool,
    pub progressive: bool,
    pub rounds: usize,
    pub histogram: Vec<DurationBucket>,
    pub tracks: Vec<TrackSummary>,
}

fn open_demuxer(input: &Path, config: &Config) -> Result<Demuxer> {
    let source = PacketLogSource::open(input)
        .with_context(|| format!("Failed to open input: {:?}", input))?;
    let settings = config.reader_settings()?;
    let demuxer = Demuxer::open(Box::new(source), Box::new(ProgressiveParser), settings)
        .with_context(|| format!("Failed to start reading {:?}", input))?;
    Ok(demuxer)
}

/// Run the startup phase only and report what it decided.
pub fn analyze(input: &Path, config: &Config) -> Result<AnalyzeReport> {
    let mut demuxer = open_demuxer(input, config)?;
    let info = demuxer.video_info().clone();
    let (rounds, histogram) = demuxer
        .estimate()
        .map(|e| (e.rounds, e.histogram.buckets().to_vec()))
        .unwrap_or_default();
    let tracks = output_tracks(demuxer.aux_streams())
        .into_iter()
        .map(|t| TrackSummary {
            track: t.key.to_string(),
            codec: t.codec,
            delay: t.delay,
            channel_mask: t.channel_mask,
        })
        .collect();
    demuxer.close()?;

    Ok(AnalyzeReport {
        framerate: info.avg_framerate,
        timebase: info.timebase,
        frame_duration: info.expected_duration,
        keyframe_offset: info.keyframe_offset,
        pts_all_invalid: info.pts_all_invalid,
        progressive: info.progressive,
        rounds,
        histogram,
        tracks,
    })
}

/// Transcode `input` into `output` with the stream-copy session.
pub fn transcode(input: &Path, output: &Path, config: &Config) -> Result<TranscodeReport> {
    let mut demuxer = open_demuxer(input, config)?;
    let read_video = config.input.read_video;

    let mut session = match config.video.encoder_input {
        Some(layout) => CopySession::with_encoder_input(layout),
        None => CopySession::new(),
    };
    let video_header = if read_video {
        session.init(demuxer.header(), demuxer.video_info())?;
        session.output_header().to_vec()
    } else {
        Vec::new()
    };
    let header = MuxHeader {
        video: read_video.then(|| demuxer.video_info().clone()),
        video_header,
        tracks: output_tracks(demuxer.aux_streams()),
    };
    let transcoded = header.tracks.iter().any(|t| t.transcode);
    let sink = PacketLogSink::create(output)
        .with_context(|| format!("Failed to create output: {:?}", output))?;
    let codecs = if transcoded {
        AuxCodecs::passthrough()
    } else {
        AuxCodecs::default()
    };
    let timeline = demuxer.timeline().clone();
    let mut muxer = Muxer::new(
        Box::new(sink),
        codecs,
        header,
        timeline.clone(),
        config.writer_settings(),
    )?;

    info!(
        input = %input.display(),
        output = %output.display(),
        framerate = %demuxer.video_info().avg_framerate,
        tracks = demuxer.aux_streams().len(),
        read_video,
        "transcode started"
    );

    let mut pump = Pump {
        session,
        timeline,
        avsync: config.input.avsync,
        frame_duration: demuxer.video_info().expected_duration,
        submitted: 0,
        received: 0,
    };
    let result = if read_video {
        pump.run(&mut demuxer, &mut muxer)
    } else {
        pump.run_aux_only(&mut demuxer, &mut muxer)
    };

    let stats = match result {
        Ok(()) => match muxer.finish() {
            Ok(stats) => stats,
            Err(e) => {
                close_quietly(&mut demuxer);
                return Err(e).context("Failed to finish output");
            }
        },
        Err(e) => {
            warn!(error = %e, "transcode failed, aborting pipeline");
            muxer.abort();
            close_quietly(&mut demuxer);
            return Err(e);
        }
    };
    demuxer.close().context("Reader failed")?;

    let report = report(&demuxer, &stats);
    info!(
        video_frames = report.video_frames,
        aux_packets = report.aux_packets,
        bytes = report.bytes,
        "transcode finished"
    );
    Ok(report)
}

fn close_quietly(demuxer: &mut Demuxer) {
    if let Err(e) = demuxer.close() {
        debug!(error = %e, "reader error during abort");
    }
}

fn report(demuxer: &Demuxer, stats: &MuxStats) -> TranscodeReport {
    TranscodeReport {
        framerate: demuxer.video_info().avg_framerate,
        keyframe_offset: demuxer.video_info().keyframe_offset,
        tracks: demuxer.aux_streams().len(),
        video_frames: stats.video_frames,
        aux_packets: stats.aux_packets,
        bytes: stats.bytes,
    }
}

struct Pump {
    session: CopySession,
    timeline: Timeline,
    avsync: AvSyncMode,
    frame_duration: i64,
    submitted: u64,
    received: i64,
}

impl Pump {
    fn run(&mut self, demuxer: &mut Demuxer, muxer: &mut Muxer) -> Result<()> {
        while let Some(packet) = demuxer.next_video_packet()? {
            let bitstream = self.avsync.bitstream(packet, self.submitted, self.frame_duration);
            self.session.submit(bitstream)?;
            self.submitted += 1;
            self.drain_session(muxer)?;
            muxer.write_aux(demuxer.take_aux_packets()?)?;

            if self.submitted % TELEMETRY_INTERVAL == 0 {
                log_telemetry(self.submitted, demuxer, muxer);
            }
        }
        self.session.flush()?;
        self.drain_session(muxer)?;
        while !demuxer.aux_exhausted() {
            muxer.write_aux(demuxer.take_aux_packets()?)?;
        }
        Ok(())
    }

    fn run_aux_only(&mut self, demuxer: &mut Demuxer, muxer: &mut Muxer) -> Result<()> {
        let mut batches = 0u64;
        while !demuxer.aux_exhausted() {
            muxer.write_aux(demuxer.take_aux_packets()?)?;
            batches += 1;
            if batches % TELEMETRY_INTERVAL == 0 {
                log_telemetry(batches, demuxer, muxer);
            }
        }
        Ok(())
    }

    fn drain_session(&mut self, muxer: &mut Muxer) -> Result<()> {
        while let Some(mut bitstream) = self.session.receive()? {
            let index = self.received;
            self.received += 1;
            if !self.timeline.trims.contains(index) {
                continue;
            }
            bitstream.timestamp = self.avsync.output_timestamp(bitstream.timestamp, &self.timeline);
            muxer.write_video(bitstream)?;
        }
        Ok(())
    }
}

fn log_telemetry(frames: u64, demuxer: &Demuxer, muxer: &Muxer) {
    let reader = demuxer.queue_usage();
    let writer = muxer.queue_usage();
    let usage = QueueUsage {
        video_out: writer.video_out,
        aux_out: writer.aux_out,
        aux_encode: writer.aux_encode,
        aux_process: writer.aux_process,
        ..reader
    };
    debug!(
        frames,
        progress = demuxer.progress_percent().unwrap_or(0.0),
        video_in = usage.video_in,
        aux_in = usage.aux_in,
        video_out = usage.video_out,
        aux_out = usage.aux_out,
        aux_encode = usage.aux_encode,
        aux_process = usage.aux_process,
        "queue usage"
    );
}
