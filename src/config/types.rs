use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use reelsync_av::{
    AudioSelect, AvSyncMode, ColorSpace, ReaderSettings, TrackSelect, WriterSettings, UNBOUNDED,
};
use reelsync_common::Rational;
use reelsync_media::TrimRange;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub input: InputConfig,

    #[serde(default)]
    pub video: VideoConfig,

    /// Frame ranges to keep, `"start:end"` with `end` exclusive or `max`.
    #[serde(default)]
    pub trim: Vec<String>,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub subtitles: SubtitleConfig,

    #[serde(default)]
    pub queues: QueueConfig,

    #[serde(default)]
    pub writer: WriterConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputConfig {
    /// Limit of the framerate analysis in seconds (unbounded if absent)
    #[serde(default)]
    pub analyze_secs: Option<u32>,

    /// 0 reads on the main thread
    #[serde(default = "default_reader_threads")]
    pub reader_threads: usize,

    #[serde(default)]
    pub avsync: AvSyncMode,

    /// false produces audio/subtitle output only
    #[serde(default = "default_true")]
    pub read_video: bool,

    /// Dump the frame ledger here when the reader closes
    #[serde(default)]
    pub frame_log: Option<PathBuf>,
}

fn default_reader_threads() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            analyze_secs: None,
            reader_threads: default_reader_threads(),
            avsync: AvSyncMode::default(),
            read_video: true,
            frame_log: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct VideoConfig {
    /// Forced average framerate, `"num/den"`
    #[serde(default)]
    pub avg_framerate: Option<String>,

    /// Surface layout the encoder takes (decoded surfaces are nv12)
    #[serde(default)]
    pub encoder_input: Option<ColorSpace>,
}

/// `"all"` or a 1-based track number.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Selector {
    Number(u32),
    Name(String),
}

impl Default for Selector {
    fn default() -> Self {
        Self::Name("all".to_string())
    }
}

impl Selector {
    pub fn to_track_select(&self) -> Result<TrackSelect> {
        match self {
            Self::Number(0) => bail!("track numbers start at 1"),
            Self::Number(n) => Ok(TrackSelect::Track(*n)),
            Self::Name(name) => Ok(name.parse()?),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AudioConfig {
    #[serde(default)]
    pub tracks: Vec<AudioTrackConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AudioTrackConfig {
    #[serde(default)]
    pub select: Selector,

    /// Channel masks (`"0x3"` or decimal), one output sub-stream each
    #[serde(default)]
    pub split: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SubtitleConfig {
    #[serde(default)]
    pub tracks: Vec<Selector>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default = "default_video_capacity")]
    pub video_capacity: usize,

    /// Unbounded if absent
    #[serde(default)]
    pub aux_capacity: Option<usize>,

    #[serde(default = "default_stage_capacity")]
    pub stage_capacity: usize,
}

fn default_video_capacity() -> usize {
    reelsync_av::reader::DEFAULT_VIDEO_CAPACITY
}

fn default_stage_capacity() -> usize {
    reelsync_av::writer::DEFAULT_STAGE_CAPACITY
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            video_capacity: default_video_capacity(),
            aux_capacity: None,
            stage_capacity: default_stage_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WriterConfig {
    #[serde(default = "default_true")]
    pub output_thread: bool,

    /// 0, 1 or 2
    #[serde(default)]
    pub aux_threads: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            output_thread: true,
            aux_threads: 0,
        }
    }
}

/// Parse a channel mask: `0x`-prefixed hex or decimal.
pub fn parse_channel_mask(s: &str) -> Result<u64> {
    let s = s.trim();
    let mask = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .with_context(|| format!("Invalid channel mask: {s:?}"))?;
    if mask == 0 {
        bail!("Channel mask {s:?} selects no channel");
    }
    Ok(mask)
}

impl Config {
    /// Parsed trim ranges, in configuration order.
    pub fn trims(&self) -> Result<Vec<TrimRange>> {
        self.trim
            .iter()
            .map(|s| {
                s.parse::<TrimRange>()
                    .with_context(|| format!("Invalid trim range: {s:?}"))
            })
            .collect()
    }

    /// Forced framerate, if configured.
    pub fn framerate(&self) -> Result<Option<Rational>> {
        let Some(s) = &self.video.avg_framerate else {
            return Ok(None);
        };
        let rate: Rational = s
            .parse()
            .with_context(|| format!("Invalid framerate: {s:?}"))?;
        if !rate.is_valid() || rate.num < 0 || rate.den < 0 {
            bail!("Framerate must be positive: {s:?}");
        }
        Ok(Some(rate))
    }

    /// Reader settings built from this configuration.
    pub fn reader_settings(&self) -> Result<ReaderSettings> {
        let audio = self
            .audio
            .tracks
            .iter()
            .map(|t| {
                Ok(AudioSelect {
                    track: t.select.to_track_select()?,
                    split: t
                        .split
                        .iter()
                        .map(|m| parse_channel_mask(m))
                        .collect::<Result<_>>()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let subtitles = self
            .subtitles
            .tracks
            .iter()
            .map(Selector::to_track_select)
            .collect::<Result<Vec<_>>>()?;

        Ok(ReaderSettings {
            trims: self.trims()?,
            audio,
            subtitles,
            analyze_secs: self.input.analyze_secs,
            forced_framerate: self.framerate()?,
            reader_threads: self.input.reader_threads,
            video_capacity: self.queues.video_capacity,
            aux_capacity: self.queues.aux_capacity.unwrap_or(UNBOUNDED),
            read_video: self.input.read_video,
            frame_log: self
                .input
                .frame_log
                .as_ref()
                .map(|p| PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())),
        })
    }

    /// Writer settings built from this configuration.
    pub fn writer_settings(&self) -> WriterSettings {
        WriterSettings {
            output_thread: self.writer.output_thread,
            aux_threads: self.writer.aux_threads,
            stage_capacity: self.queues.stage_capacity,
        }
    }
}
