//! JSON-lines packet logs.
//!
//! A packet log stands in for a container file. The first line describes
//! the streams; every following line is one packet in file order:
//!
//! ```text
//! {"streams":[{"index":0,"kind":"video","codec":"h264",...}],"duration":4000000}
//! {"stream":0,"pts":0,"dts":-1,"duration":1,"keyframe":true,"data":"0000000165"}
//! ```
//!
//! [`PacketLogSink`] writes the same format, so a mux output can be read
//! back with [`PacketLogSource`].

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use reelsync_common::{Rational, StreamKind, TrackKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::Bitstream;
use crate::source::{PacketSource, StreamInfo};
use crate::writer::{MuxHeader, OutputTrack, PacketSink};
use crate::{Error, Packet, Result};

/// First line of a packet log.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogHeader {
    pub streams: Vec<StreamInfo>,
    /// Container duration in microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    /// Output tracks, present in logs written by a mux.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tracks: Vec<OutputTrack>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LogPacket {
    stream: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dts: Option<i64>,
    #[serde(default)]
    duration: i64,
    #[serde(default)]
    keyframe: bool,
    #[serde(with = "crate::source::hex_bytes")]
    data: Vec<u8>,
}

impl From<&Packet> for LogPacket {
    fn from(packet: &Packet) -> Self {
        Self {
            stream: packet.stream_index,
            pts: packet.pts,
            dts: packet.dts,
            duration: packet.duration,
            keyframe: packet.is_keyframe(),
            data: packet.data.to_vec(),
        }
    }
}

impl From<LogPacket> for Packet {
    fn from(log: LogPacket) -> Self {
        Packet::new(log.stream, log.data)
            .with_timing(log.pts, log.dts, log.duration)
            .with_keyframe(log.keyframe)
    }
}

/// Reads a packet log.
pub struct PacketLogSource {
    header: LogHeader,
    lines: std::io::Lines<Box<dyn BufRead + Send>>,
    line_no: usize,
}

impl std::fmt::Debug for PacketLogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketLogSource")
            .field("streams", &self.header.streams.len())
            .field("line_no", &self.line_no)
            .finish()
    }
}

impl PacketLogSource {
    /// Open a packet log file.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::file_not_found(path));
        }
        let file = File::open(path)?;
        debug!(path = %path.display(), "opening packet log");
        Self::from_reader(BufReader::new(file))
    }

    /// Read a packet log from any buffered reader.
    pub fn from_reader(reader: impl BufRead + Send + 'static) -> Result<Self> {
        let reader: Box<dyn BufRead + Send> = Box::new(reader);
        let mut lines = reader.lines();
        let mut line_no = 0;
        let header = loop {
            line_no += 1;
            let Some(line) = lines.next() else {
                return Err(Error::source_error("packet log is empty"));
            };
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            break serde_json::from_str::<LogHeader>(&line)
                .map_err(|e| Error::source_error(format!("line {line_no}: bad header: {e}")))?;
        };
        for (i, stream) in header.streams.iter().enumerate() {
            if stream.index != i {
                return Err(Error::source_error(format!(
                    "stream {} listed at position {i}",
                    stream.index
                )));
            }
        }
        Ok(Self {
            header,
            lines,
            line_no,
        })
    }

    /// Parsed header line.
    pub fn header(&self) -> &LogHeader {
        &self.header
    }
}

impl PacketSource for PacketLogSource {
    fn streams(&self) -> &[StreamInfo] {
        &self.header.streams
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        for line in self.lines.by_ref() {
            self.line_no += 1;
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let packet: LogPacket = serde_json::from_str(&line)
                .map_err(|e| Error::source_error(format!("line {}: {e}", self.line_no)))?;
            if packet.stream >= self.header.streams.len() {
                return Err(Error::source_error(format!(
                    "line {}: unknown stream {}",
                    self.line_no, packet.stream
                )));
            }
            return Ok(Some(packet.into()));
        }
        Ok(None)
    }

    fn container_duration(&self) -> Option<i64> {
        self.header.duration
    }
}

/// Write a packet log from streams and packets.
pub fn write_packet_log<'a>(
    path: &Path,
    header: &LogHeader,
    packets: impl IntoIterator<Item = &'a Packet>,
) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut out, header)?;
    out.write_all(b"\n")?;
    for packet in packets {
        serde_json::to_writer(&mut out, &LogPacket::from(packet))?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

/// Writes mux output as a packet log.
///
/// The video stream, when present, is stream 0; output tracks follow in
/// header order.
pub struct PacketLogSink {
    out: Box<dyn Write + Send>,
    indices: Vec<(TrackKey, usize)>,
    video_duration: i64,
    header_written: bool,
}

impl std::fmt::Debug for PacketLogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketLogSink")
            .field("tracks", &self.indices.len())
            .field("header_written", &self.header_written)
            .finish()
    }
}

impl PacketLogSink {
    /// Create the output file.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        debug!(path = %path.display(), "writing packet log");
        Ok(Self::from_writer(BufWriter::new(file)))
    }

    /// Write to any writer.
    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            out: Box::new(writer),
            indices: Vec::new(),
            video_duration: 0,
            header_written: false,
        }
    }

    fn line<T: Serialize>(&mut self, value: &T) -> Result<()> {
        serde_json::to_writer(&mut self.out, value)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }
}

fn header_streams(header: &MuxHeader) -> Vec<StreamInfo> {
    let mut streams = Vec::with_capacity(header.tracks.len() + 1);
    if let Some(video) = &header.video {
        let codec = video.codec.map_or("rawvideo", |c| c.name());
        let mut info = StreamInfo::new(0, StreamKind::Video, codec, video.timebase);
        info.decoder_rate = video.avg_framerate;
        info.header = header.video_header.clone();
        streams.push(info);
    }
    for track in &header.tracks {
        let index = streams.len();
        let mut info = StreamInfo::new(index, track.kind, track.codec.clone(), track.timebase);
        info.channels = track.channel_mask.map_or(0, |m| m.count_ones() as u16);
        streams.push(info);
    }
    streams
}

impl PacketSink for PacketLogSink {
    fn write_header(&mut self, header: &MuxHeader) -> Result<()> {
        if self.header_written {
            return Err(Error::sink_error("header written twice"));
        }
        let streams = header_streams(header);
        let offset = usize::from(header.video.is_some());
        self.indices = header
            .tracks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.key, i + offset))
            .collect();
        self.video_duration = header.video.as_ref().map_or(0, |v| v.expected_duration);
        let log_header = LogHeader {
            streams,
            duration: None,
            tracks: header.tracks.clone(),
        };
        self.line(&log_header)?;
        self.header_written = true;
        Ok(())
    }

    fn write_video(&mut self, bitstream: &Bitstream) -> Result<()> {
        if !self.header_written {
            return Err(Error::sink_error("video written before header"));
        }
        let packet = LogPacket {
            stream: 0,
            pts: Some(bitstream.timestamp),
            dts: bitstream.dts,
            duration: self.video_duration,
            keyframe: bitstream.keyframe,
            data: bitstream.data.to_vec(),
        };
        self.line(&packet)
    }

    fn write_packet(&mut self, key: TrackKey, packet: &Packet) -> Result<()> {
        let Some(&(_, index)) = self.indices.iter().find(|(k, _)| *k == key) else {
            return Err(Error::sink_error(format!("no output stream for {key}")));
        };
        let mut log = LogPacket::from(packet);
        log.stream = index;
        self.line(&log)
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Timebase of `stream` in a parsed header, for readers of mux output.
pub fn stream_timebase(header: &LogHeader, stream: usize) -> Option<Rational> {
    header.streams.get(stream).map(|s| s.timebase)
}
