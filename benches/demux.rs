//! Benchmarks for the demux reader
//!
//! Runs the startup phase plus a full drain over in-memory inputs.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use reelsync_av::{
    AudioSelect, Demuxer, MemorySource, Packet, ProgressiveParser, ReaderSettings, StreamInfo,
};
use reelsync_common::{Rational, StreamKind};
use reelsync_media::TrimRange;
use std::time::Duration;

const MS: Rational = Rational::new(1, 1000);

fn streams() -> Vec<StreamInfo> {
    let mut video = StreamInfo::new(0, StreamKind::Video, "h264", MS);
    video.header = vec![0, 0, 0, 1, 0x67, 0x64, 0, 0x28, 0, 0, 0, 1, 0x68];
    let mut audio = StreamInfo::new(1, StreamKind::Audio, "aac", MS);
    audio.channels = 2;
    vec![video, audio]
}

/// 40ms frames with two 20ms audio packets each.
fn packets(frames: i64) -> Vec<Packet> {
    let mut out = Vec::with_capacity(frames as usize * 3);
    for i in 0..frames {
        out.push(
            Packet::new(0, vec![0, 0, 0, 1, 0x65, 0x88, 0x84])
                .with_timing(Some(i * 40), Some(i * 40), 40)
                .with_keyframe(i % 50 == 0),
        );
        for half in 0..2 {
            let pts = i * 40 + half * 20;
            out.push(Packet::new(1, vec![0xff; 64]).with_timing(Some(pts), Some(pts), 20));
        }
    }
    out
}

fn drain(packets: &[Packet], trims: Vec<TrimRange>, reader_threads: usize) -> usize {
    let source = MemorySource::new(streams(), packets.iter().cloned());
    let settings = ReaderSettings {
        trims,
        audio: vec![AudioSelect::default()],
        reader_threads,
        ..ReaderSettings::default()
    };
    let mut demuxer =
        Demuxer::open(Box::new(source), Box::new(ProgressiveParser), settings).unwrap();
    let mut count = 0;
    while let Some(packet) = demuxer.next_video_packet().unwrap() {
        black_box(&packet);
        count += 1;
        count += demuxer.take_aux_packets().unwrap().len();
    }
    while !demuxer.aux_exhausted() {
        count += demuxer.take_aux_packets().unwrap().len();
    }
    demuxer.close().unwrap();
    count
}

fn bench_demux(c: &mut Criterion) {
    let mut group = c.benchmark_group("demux");
    group.measurement_time(Duration::from_secs(5));

    for frames in [1_000i64, 10_000] {
        let input = packets(frames);
        group.throughput(Throughput::Elements(input.len() as u64));

        group.bench_with_input(BenchmarkId::new("inline", frames), &input, |b, input| {
            b.iter(|| drain(input, Vec::new(), 0))
        });
        group.bench_with_input(BenchmarkId::new("threaded", frames), &input, |b, input| {
            b.iter(|| drain(input, Vec::new(), 1))
        });
        group.bench_with_input(BenchmarkId::new("trimmed", frames), &input, |b, input| {
            let trims = vec![
                TrimRange::new(100, Some(frames / 2)).unwrap(),
                TrimRange::open(frames / 2 + 100),
            ];
            b.iter(|| drain(input, trims.clone(), 0))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_demux);
criterion_main!(benches);
