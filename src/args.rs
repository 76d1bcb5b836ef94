use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use storyreel::render::BackendKind;

#[derive(Parser, Debug)]
#[clap(name = "storyreel", version, about = "Compile narrated image slideshows into MP4")]
pub struct Args {
    /// Path to a TOML config file
    #[clap(long, global = true, default_value = "storyreel.toml")]
    pub config: PathBuf,

    /// Override the job time limit in seconds
    #[clap(long, global = true)]
    pub timeout: Option<u64>,

    /// Render backends to try, in order (repeatable)
    #[clap(long = "backend", global = true, value_enum)]
    pub backends: Vec<BackendKind>,

    /// Also write the caption track next to the output
    #[clap(long, global = true, value_enum)]
    pub captions: Option<CaptionFormat>,

    /// Debug logging unless RUST_LOG is set
    #[clap(long, global = true)]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Render a job described by a JSON manifest
    Compile {
        #[clap(long)]
        manifest: PathBuf,

        #[clap(long, default_value = "out.mp4")]
        out: PathBuf,

        #[clap(flatten)]
        retry: RetryArgs,
    },
    /// Generate script and narration locally, then render
    Generate {
        #[clap(long)]
        topic: String,

        /// Directory of stock images to cycle through
        #[clap(long)]
        images: PathBuf,

        #[clap(long, default_value = "out.mp4")]
        out: PathBuf,

        #[clap(long, default_value = "./tts/en_US-hfc_male-medium.onnx")]
        piper_model: PathBuf,

        #[clap(long, default_value_t = 60)]
        duration: u32,

        #[clap(long, default_value = "en")]
        language: String,

        #[clap(flatten)]
        retry: RetryArgs,
    },
    /// Report which tools and backends are usable on this machine
    Check,
}

#[derive(ClapArgs, Debug, Clone, Copy)]
pub struct RetryArgs {
    /// Total runs allowed when a job times out or a dependency is missing
    #[clap(long, default_value_t = 1)]
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CaptionFormat {
    Srt,
    Json,
}
