mod cli;

use reelsync::{config, transcode};

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands, OverrideArgs};
use std::path::Path;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "reelsync=trace,reelsync_av=trace,reelsync_media=trace".to_string()
        } else {
            "reelsync=info,reelsync_av=info,reelsync_media=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            input,
            output,
            overrides,
        } => run_file(&input, &output, cli.config.as_deref(), overrides),
        Commands::Analyze {
            input,
            json,
            overrides,
        } => analyze_file(&input, json, cli.config.as_deref(), overrides),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("reelsync {}", env!("CARGO_PKG_VERSION"));
            println!("SIMD: {}", reelsync_av::convert::available_simd());
            Ok(())
        }
    }
}

fn load(config_path: Option<&Path>, overrides: OverrideArgs) -> Result<config::Config> {
    let mut config = config::load_config_or_default(config_path)?;
    config::apply_overrides(&mut config, overrides.into())?;
    Ok(config)
}

fn run_file(
    input: &Path,
    output: &Path,
    config_path: Option<&Path>,
    overrides: OverrideArgs,
) -> Result<()> {
    let config = load(config_path, overrides)?;
    let report = transcode::transcode(input, output, &config)?;

    println!("Input: {}", input.display());
    println!("Output: {}", output.display());
    println!("Framerate: {}", report.framerate);
    println!("Keyframe offset: {}", report.keyframe_offset);
    println!("Video frames: {}", report.video_frames);
    println!("Aux packets: {} ({} tracks)", report.aux_packets, report.tracks);
    println!("Bytes: {}", report.bytes);
    Ok(())
}

fn analyze_file(
    input: &Path,
    json: bool,
    config_path: Option<&Path>,
    overrides: OverrideArgs,
) -> Result<()> {
    let config = load(config_path, overrides)?;
    let report = transcode::analyze(input, &config)?;

    if json {
        let json_str = serde_json::to_string_pretty(&report)?;
        println!("{}", json_str);
        return Ok(());
    }

    println!("File: {}", input.display());
    println!("Framerate: {}", report.framerate);
    println!("Timebase: {}", report.timebase);
    println!("Frame duration: {}", report.frame_duration);
    println!("Keyframe offset: {}", report.keyframe_offset);
    println!(
        "Timestamps: {}",
        if report.pts_all_invalid {
            "synthesized"
        } else {
            "container"
        }
    );
    println!("Progressive: {}", report.progressive);

    println!("\nDuration histogram ({} rounds):", report.rounds);
    for bucket in &report.histogram {
        println!("  {:>8} x {}", bucket.duration, bucket.count);
    }

    println!("\nTracks: {}", report.tracks.len());
    for track in &report.tracks {
        print!("  {} {} delay={}", track.track, track.codec, track.delay);
        if let Some(mask) = track.channel_mask {
            print!(" channels={:#x}", mask);
        }
        println!();
    }
    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            config::load_config(p)?
        }
        None => {
            println!("No config file specified, using defaults");
            config::Config::default()
        }
    };
    println!("✓ Configuration is valid");
    println!("  Trims: {}", config.trim.len());
    println!("  Audio selectors: {}", config.audio.tracks.len());
    println!("  Subtitle selectors: {}", config.subtitles.tracks.len());
    println!("  Reader threads: {}", config.input.reader_threads);
    println!(
        "  Writer: output_thread={} aux_threads={}",
        config.writer.output_thread, config.writer.aux_threads
    );
    Ok(())
}
