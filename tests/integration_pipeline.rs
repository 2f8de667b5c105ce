//! Library-level transcode runs over generated packet logs.

mod common;

use common::{read_output, Fixture};
use reelsync::config::{AudioTrackConfig, Config, Selector};
use reelsync::transcode::{analyze, transcode};
use reelsync_av::{AvSyncMode, ColorSpace};
use reelsync_common::Rational;
use tempfile::tempdir;

fn with_audio() -> Config {
    let mut config = Config::default();
    config.audio.tracks.push(AudioTrackConfig::default());
    config
}

#[test]
fn test_copy_keeps_everything() {
    let dir = tempdir().unwrap();
    let input = Fixture::default().write(dir.path());
    let output = dir.path().join("out.jsonl");

    let report = transcode(&input, &output, &with_audio()).unwrap();
    assert_eq!(report.framerate, Rational::new(25, 1));
    assert_eq!(report.keyframe_offset, 0);
    assert_eq!(report.tracks, 1);
    assert_eq!(report.video_frames, 50);
    assert_eq!(report.aux_packets, 100);

    let (video, aux) = read_output(&output);
    assert_eq!(video, (0..50).map(|k| k * 40).collect::<Vec<_>>());
    assert!(aux.iter().all(|&(stream, _)| stream == 1));
    assert_eq!(
        aux.iter().map(|&(_, pts)| pts).collect::<Vec<_>>(),
        (0..100).map(|k| k * 20).collect::<Vec<_>>()
    );
}

#[test]
fn test_no_selectors_copies_video_only() {
    let dir = tempdir().unwrap();
    let input = Fixture::default().write(dir.path());
    let output = dir.path().join("out.jsonl");

    let report = transcode(&input, &output, &Config::default()).unwrap();
    assert_eq!(report.tracks, 0);
    assert_eq!(report.aux_packets, 0);
    let (video, aux) = read_output(&output);
    assert_eq!(video.len(), 50);
    assert!(aux.is_empty());
}

#[test]
fn test_trims_in_both_sync_modes() {
    let dir = tempdir().unwrap();
    let input = Fixture::default().write(dir.path());

    for (i, avsync) in [AvSyncMode::Through, AvSyncMode::CheckPts].into_iter().enumerate() {
        let mut config = with_audio();
        config.trim = vec!["0:10".to_string(), "20:max".to_string()];
        config.input.avsync = avsync;
        let output = dir.path().join(format!("out{i}.jsonl"));

        let report = transcode(&input, &output, &config).unwrap();
        assert_eq!(report.video_frames, 40, "{avsync:?}");
        assert_eq!(report.aux_packets, 80, "{avsync:?}");

        let (video, aux) = read_output(&output);
        assert_eq!(video, (0..40).map(|k| k * 40).collect::<Vec<_>>());
        assert_eq!(
            aux.iter().map(|&(_, pts)| pts).collect::<Vec<_>>(),
            (0..80).map(|k| k * 20).collect::<Vec<_>>()
        );
    }
}

#[test]
fn test_threaded_writer_matches_inline() {
    let dir = tempdir().unwrap();
    let input = Fixture {
        audio_tracks: 2,
        ..Fixture::default()
    }
    .write(dir.path());

    let mut outputs = Vec::new();
    for (i, (reader_threads, output_thread, aux_threads)) in
        [(0, false, 0), (1, true, 1), (1, true, 2)].into_iter().enumerate()
    {
        let mut config = with_audio();
        config.trim = vec!["5:30".to_string()];
        config.input.reader_threads = reader_threads;
        config.writer.output_thread = output_thread;
        config.writer.aux_threads = aux_threads;
        config.queues.video_capacity = 4;
        config.queues.stage_capacity = 2;
        let output = dir.path().join(format!("out{i}.jsonl"));
        let report = transcode(&input, &output, &config).unwrap();
        assert_eq!(report.video_frames, 25);
        assert_eq!(report.tracks, 2);
        outputs.push(read_output(&output));
    }
    let (video, aux) = &outputs[0];
    assert_eq!(video.len(), 25);
    for stream in [1, 2] {
        assert_eq!(aux.iter().filter(|&&(s, _)| s == stream).count(), 50);
    }
    for other in &outputs[1..] {
        assert_eq!(&other.0, video);
        let mut left = aux.clone();
        let mut right = other.1.clone();
        left.sort_unstable();
        right.sort_unstable();
        assert_eq!(left, right);
    }
}

#[test]
fn test_leading_packets_skipped() {
    let dir = tempdir().unwrap();
    let input = Fixture {
        leading: 3,
        ..Fixture::default()
    }
    .write(dir.path());
    let output = dir.path().join("out.jsonl");

    let report = transcode(&input, &output, &with_audio()).unwrap();
    assert_eq!(report.keyframe_offset, 3);
    assert_eq!(report.video_frames, 50);
    assert_eq!(report.aux_packets, 100);

    let (video, _) = read_output(&output);
    assert_eq!(video.first(), Some(&0));
}

#[test]
fn test_subtitles_follow_audio() {
    let dir = tempdir().unwrap();
    let input = Fixture {
        subtitles: true,
        ..Fixture::default()
    }
    .write(dir.path());
    let output = dir.path().join("out.jsonl");

    let mut config = with_audio();
    config.subtitles.tracks.push(Selector::default());
    let report = transcode(&input, &output, &config).unwrap();
    assert_eq!(report.tracks, 2);

    let (_, aux) = read_output(&output);
    let subtitles: Vec<i64> = aux
        .iter()
        .filter(|&&(s, _)| s == 2)
        .map(|&(_, pts)| pts)
        .collect();
    assert_eq!(subtitles, vec![0, 1000]);
    assert_eq!(aux.iter().filter(|&&(s, _)| s == 1).count(), 100);
}

#[test]
fn test_split_track_becomes_sub_streams() {
    let dir = tempdir().unwrap();
    let input = Fixture::default().write(dir.path());
    let output = dir.path().join("out.jsonl");

    let mut config = Config::default();
    config.audio.tracks.push(AudioTrackConfig {
        select: Selector::Number(1),
        split: vec!["0x1".to_string(), "0x2".to_string()],
    });
    let report = transcode(&input, &output, &config).unwrap();
    assert_eq!(report.tracks, 2);
    assert_eq!(report.aux_packets, 200);

    let (_, aux) = read_output(&output);
    assert_eq!(aux.iter().filter(|&&(s, _)| s == 1).count(), 100);
    assert_eq!(aux.iter().filter(|&&(s, _)| s == 2).count(), 100);
}

#[test]
fn test_audio_only_with_video_clock() {
    let dir = tempdir().unwrap();
    let input = Fixture::default().write(dir.path());
    let output = dir.path().join("out.jsonl");

    let mut config = with_audio();
    config.input.read_video = false;
    let report = transcode(&input, &output, &config).unwrap();
    assert_eq!(report.video_frames, 0);
    assert_eq!(report.aux_packets, 100);

    let (video, aux) = read_output(&output);
    assert!(video.is_empty());
    assert!(aux.iter().all(|&(stream, _)| stream == 0));
}

#[test]
fn test_audio_only_without_video() {
    let dir = tempdir().unwrap();
    let input = Fixture {
        frames: 0,
        ..Fixture::default()
    }
    .write(dir.path());

    let mut config = with_audio();
    config.input.read_video = false;
    let analyzed = analyze(&input, &config).unwrap();
    assert_eq!(analyzed.framerate, Rational::new(30, 1));
    assert_eq!(analyzed.rounds, 0);
    assert_eq!(analyzed.tracks.len(), 1);

    config.video.avg_framerate = Some("25".to_string());
    let output = dir.path().join("out.jsonl");
    let report = transcode(&input, &output, &config).unwrap();
    assert_eq!(report.framerate, Rational::new(25, 1));
    assert_eq!(report.aux_packets, 100);
    let (_, aux) = read_output(&output);
    assert_eq!(
        aux.iter().map(|&(_, pts)| pts).collect::<Vec<_>>(),
        (0..100).map(|k| k * 20).collect::<Vec<_>>()
    );
}

#[test]
fn test_missing_video_is_an_error() {
    let dir = tempdir().unwrap();
    let input = Fixture {
        frames: 0,
        ..Fixture::default()
    }
    .write(dir.path());
    let result = transcode(&input, &dir.path().join("out.jsonl"), &with_audio());
    assert!(result.is_err());
}

#[test]
fn test_missing_input_is_an_error() {
    let dir = tempdir().unwrap();
    let err = transcode(
        &dir.path().join("nope.jsonl"),
        &dir.path().join("out.jsonl"),
        &Config::default(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("Failed to open input"));
}

#[test]
fn test_analyze_reports_startup() {
    let dir = tempdir().unwrap();
    let input = Fixture {
        leading: 2,
        audio_offset: 10,
        ..Fixture::default()
    }
    .write(dir.path());

    let mut config = with_audio();
    config.audio.tracks[0].split = vec!["3".to_string()];
    let report = analyze(&input, &config).unwrap();
    assert_eq!(report.framerate, Rational::new(25, 1));
    assert_eq!(report.timebase, Rational::new(1, 1000));
    assert_eq!(report.frame_duration, 40);
    assert_eq!(report.keyframe_offset, 2);
    assert!(!report.pts_all_invalid);
    assert!(report.progressive);
    assert!(report.rounds >= 1);
    assert_eq!(report.histogram.first().map(|b| b.duration), Some(40));
    assert_eq!(report.tracks.len(), 1);
    assert_eq!(report.tracks[0].channel_mask, Some(3));
}

#[test]
fn test_forced_framerate_and_frame_log() {
    let dir = tempdir().unwrap();
    let input = Fixture::default().write(dir.path());
    let frame_log = dir.path().join("frames.log");

    let mut config = with_audio();
    config.video.avg_framerate = Some("24000/1001".to_string());
    config.input.frame_log = Some(frame_log.clone());
    let report = transcode(&input, &dir.path().join("out.jsonl"), &config).unwrap();
    assert_eq!(report.framerate, Rational::new(24000, 1001));

    let log = std::fs::read_to_string(frame_log).unwrap();
    assert!(log.contains("# terminal pts="), "{log}");
}

#[test]
fn test_encoder_input_layout() {
    let dir = tempdir().unwrap();
    let input = Fixture::default().write(dir.path());

    let mut config = with_audio();
    config.video.encoder_input = Some(ColorSpace::Yv12);
    let report = transcode(&input, &dir.path().join("out.jsonl"), &config).unwrap();
    assert_eq!(report.video_frames, 50);
    assert_eq!(report.aux_packets, 100);
}

#[test]
fn test_long_input_keeps_all_audio() {
    let dir = tempdir().unwrap();
    let input = Fixture {
        frames: 200,
        ..Fixture::default()
    }
    .write(dir.path());

    for (i, reader_threads) in [0, 1].into_iter().enumerate() {
        let mut config = with_audio();
        config.input.reader_threads = reader_threads;
        config.queues.aux_capacity = Some(8);
        let output = dir.path().join(format!("out{i}.jsonl"));
        let report = transcode(&input, &output, &config).unwrap();
        assert_eq!(report.video_frames, 200);
        assert_eq!(report.aux_packets, 400, "reader_threads {reader_threads}");

        let (_, aux) = read_output(&output);
        let mut pts: Vec<i64> = aux.iter().map(|&(_, pts)| pts).collect();
        pts.sort_unstable();
        assert_eq!(pts, (0..400).map(|k| k * 20).collect::<Vec<_>>());
    }
}
