use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use reelsync::config::Overrides;

#[derive(Parser)]
#[command(name = "reelsync")]
#[command(author, version, about = "Trim-aware A/V sync transcode pipeline")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags that override configuration values.
#[derive(Args, Debug, Clone, Default)]
pub struct OverrideArgs {
    /// Frame range to keep, e.g. `0:100` or `200:max` (repeatable)
    #[arg(long = "trim", value_name = "START:END")]
    pub trim: Vec<String>,

    /// Force the average framerate, e.g. `24000/1001`
    #[arg(long, value_name = "NUM/DEN")]
    pub fps: Option<String>,

    /// Limit framerate analysis to this many seconds
    #[arg(long, value_name = "SECS")]
    pub analyze: Option<u32>,
}

impl From<OverrideArgs> for Overrides {
    fn from(args: OverrideArgs) -> Self {
        Self {
            trim: args.trim,
            fps: args.fps,
            analyze_secs: args.analyze,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full pipeline from an input packet log to an output packet log
    Run {
        /// Input packet log
        #[arg(required = true)]
        input: PathBuf,

        /// Output packet log
        #[arg(short, long, required = true)]
        output: PathBuf,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Run the startup phase only and report framerate, offset and tracks
    Analyze {
        /// Input packet log
        #[arg(required = true)]
        input: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}
