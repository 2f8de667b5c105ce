mod types;

pub use types::*;

use anyhow::{Context, Result};
use reelsync_media::TrimSet;
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    // Try default locations
    let default_paths = [
        "./reelsync.toml",
        "~/.config/reelsync/config.toml",
        "/etc/reelsync/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    // Return default config if no file found
    Ok(Config::default())
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub trim: Vec<String>,
    pub fps: Option<String>,
    pub analyze_secs: Option<u32>,
}

/// Apply command-line overrides and validate the result.
pub fn apply_overrides(config: &mut Config, overrides: Overrides) -> Result<()> {
    if !overrides.trim.is_empty() {
        config.trim = overrides.trim;
    }
    if overrides.fps.is_some() {
        config.video.avg_framerate = overrides.fps;
    }
    if overrides.analyze_secs.is_some() {
        config.input.analyze_secs = overrides.analyze_secs;
    }
    validate_config(config)
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.queues.video_capacity == 0 {
        anyhow::bail!("queues.video_capacity cannot be 0");
    }
    if config.queues.aux_capacity == Some(0) {
        anyhow::bail!("queues.aux_capacity cannot be 0 (omit it for unbounded)");
    }

    config.writer_settings().validate()?;

    // Ordering and overlap
    let trims = config.trims()?;
    TrimSet::compile(&trims, 0).context("Invalid trim list")?;

    config.framerate()?;
    let settings = config.reader_settings()?;

    if let Some(layout) = config.video.encoder_input {
        if layout != reelsync_av::DECODED_SURFACE
            && reelsync_av::find_converter(reelsync_av::DECODED_SURFACE, layout, false).is_none()
        {
            anyhow::bail!("video.encoder_input {layout:?} has no surface converter");
        }
    }

    if !config.input.read_video && settings.audio.is_empty() && settings.subtitles.is_empty() {
        anyhow::bail!("input.read_video = false requires at least one audio or subtitle track");
    }

    if let Some(path) = &config.input.frame_log {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                tracing::warn!("Frame log directory does not exist: {:?}", parent);
            }
        }
    }

    Ok(())
}
