//! Shared fixtures: synthetic packet logs.
#![allow(dead_code)]

use std::path::{Path, PathBuf};

use reelsync_av::{write_packet_log, LogHeader, Packet, StreamInfo};
use reelsync_common::{Rational, StreamKind};

pub const MS: Rational = Rational::new(1, 1000);

/// Shape of a generated input.
#[derive(Debug, Clone)]
pub struct Fixture {
    /// Video frames of 40ms; 0 for a file without video.
    pub frames: i64,
    /// Stereo audio tracks, each with two 20ms packets per frame.
    pub audio_tracks: usize,
    /// Adds one subtitle packet every 25 frames.
    pub subtitles: bool,
    /// Non-keyframe packets before the first keyframe.
    pub leading: usize,
    /// Audio start offset in ms.
    pub audio_offset: i64,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            frames: 50,
            audio_tracks: 1,
            subtitles: false,
            leading: 0,
            audio_offset: 0,
        }
    }
}

impl Fixture {
    pub fn streams(&self) -> Vec<StreamInfo> {
        let mut streams = Vec::new();
        if self.frames > 0 {
            let mut video = StreamInfo::new(0, StreamKind::Video, "h264", MS);
            video.header = vec![0, 0, 0, 1, 0x67, 0x64, 0, 0x28, 0, 0, 0, 1, 0x68, 0xee];
            streams.push(video);
        }
        for _ in 0..self.audio_tracks {
            let mut audio = StreamInfo::new(streams.len(), StreamKind::Audio, "aac", MS);
            audio.channels = 2;
            streams.push(audio);
        }
        if self.subtitles {
            streams.push(StreamInfo::new(streams.len(), StreamKind::Subtitle, "subrip", MS));
        }
        streams
    }

    pub fn packets(&self) -> Vec<Packet> {
        let has_video = self.frames > 0;
        let first_audio = usize::from(has_video);
        let subtitle_index = first_audio + self.audio_tracks;
        let mut out = Vec::new();

        for k in 0..self.leading {
            let pts = -40 * (self.leading - k) as i64;
            out.push(Packet::new(0, vec![0, 0, 0, 1, 0x41]).with_timing(Some(pts), Some(pts), 40));
        }
        let frames = if has_video { self.frames } else { 50 };
        for i in 0..frames {
            if has_video {
                out.push(
                    Packet::new(0, vec![0, 0, 0, 1, 0x65, i as u8])
                        .with_timing(Some(i * 40), Some(i * 40), 40)
                        .with_keyframe(i % 25 == 0),
                );
            }
            for track in 0..self.audio_tracks {
                for half in 0..2 {
                    let pts = self.audio_offset + i * 40 + half * 20;
                    out.push(
                        Packet::new(first_audio + track, vec![0xa0 + track as u8])
                            .with_timing(Some(pts), Some(pts), 20),
                    );
                }
            }
            if self.subtitles && i % 25 == 0 {
                out.push(
                    Packet::new(subtitle_index, b"hello".to_vec())
                        .with_timing(Some(i * 40), Some(i * 40), 40),
                );
            }
        }
        out
    }

    pub fn write(&self, dir: &Path) -> PathBuf {
        let path = dir.join("input.jsonl");
        let header = LogHeader {
            streams: self.streams(),
            duration: Some(self.frames.max(50) * 40_000),
            tracks: Vec::new(),
        };
        write_packet_log(&path, &header, &self.packets()).unwrap();
        path
    }
}

/// Pts of every output packet, split into video (stream 0) and the rest.
pub fn read_output(path: &Path) -> (Vec<i64>, Vec<(usize, i64)>) {
    use reelsync_av::{PacketLogSource, PacketSource};

    let mut source = PacketLogSource::open(path).unwrap();
    let has_video = source
        .streams()
        .first()
        .is_some_and(|s| s.kind == StreamKind::Video);
    let (mut video, mut aux) = (Vec::new(), Vec::new());
    while let Some(packet) = source.read_packet().unwrap() {
        let pts = packet.pts.unwrap_or(0);
        if has_video && packet.stream_index == 0 {
            video.push(pts);
        } else {
            aux.push((packet.stream_index, pts));
        }
    }
    (video, aux)
}
