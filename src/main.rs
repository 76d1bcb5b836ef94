mod args;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use args::{Args, CaptionFormat, Command};
use storyreel::collab::{
    LocalImageLibrary, LogStatusSink, OfflineScriptGenerator, PiperSynthesizer, UnlimitedCredits,
};
use storyreel::job::JobManifest;
use storyreel::pipeline::{AssetSources, GenerationRequest};
use storyreel::process::{SystemToolRunner, ToolRunner};
use storyreel::render::build_backend;
use storyreel::subtitle::{write_captions_json, write_srt};
use storyreel::{JobOutcome, Orchestrator, PipelineConfig, RenderJob};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config = PipelineConfig::load_from_path(&args.config)?;
    if let Some(secs) = args.timeout.filter(|s| *s > 0) {
        config.job_timeout_secs = secs;
    }
    if !args.backends.is_empty() {
        config.backends = args.backends.clone();
    }
    debug!("Effective config: {:?}", config);

    let runner: Arc<dyn ToolRunner> = Arc::new(SystemToolRunner);

    match args.command {
        Command::Check => check(&config, runner.as_ref()),
        Command::Compile {
            manifest,
            out,
            retry,
        } => {
            let text = std::fs::read_to_string(&manifest)
                .with_context(|| format!("Failed to read manifest {}", manifest.display()))?;
            let manifest: JobManifest = serde_json::from_str(&text)
                .with_context(|| format!("Invalid manifest {}", manifest.display()))?;
            let mut job = RenderJob::from_manifest(manifest, out);

            let orchestrator = Orchestrator::new(config, runner, Arc::new(LogStatusSink));
            let outcome = orchestrator.run_with_retry(&mut job, retry.attempts).await?;
            write_caption_track(&outcome, args.captions, orchestrator.config())
        }
        Command::Generate {
            topic,
            images,
            out,
            piper_model,
            duration,
            language,
            retry,
        } => {
            std::fs::create_dir_all(&config.temp_root)?;
            let tts_dir = tempfile::Builder::new()
                .prefix("storyreel-tts-")
                .tempdir_in(&config.temp_root)?;

            let script = OfflineScriptGenerator::default();
            let library = LocalImageLibrary::open(&images)?;
            let speech = PiperSynthesizer::new(&piper_model, tts_dir.path());
            let sources = AssetSources {
                script: &script,
                images: &library,
                speech: &speech,
                credits: &UnlimitedCredits,
            };
            let request = GenerationRequest {
                topic,
                duration_secs: duration,
                language,
                voice_style: String::new(),
                image_style: String::new(),
                cost: 0,
                output_path: out,
            };

            let orchestrator = Orchestrator::new(config, runner, Arc::new(LogStatusSink));
            let mut job = orchestrator.generate_assets(&request, &sources).await?;
            let outcome = orchestrator.run_with_retry(&mut job, retry.attempts).await?;
            write_caption_track(&outcome, args.captions, orchestrator.config())
        }
    }
}

fn write_caption_track(
    outcome: &JobOutcome,
    format: Option<CaptionFormat>,
    config: &PipelineConfig,
) -> anyhow::Result<()> {
    match format {
        Some(CaptionFormat::Srt) => {
            let path = outcome.output_path.with_extension("srt");
            write_srt(&path, &outcome.captions, config.max_line_chars)?;
            info!("Captions written to {}", path.display());
        }
        Some(CaptionFormat::Json) => {
            let path = outcome.output_path.with_extension("json");
            write_captions_json(&path, &outcome.captions)?;
            info!("Captions written to {}", path.display());
        }
        None => {}
    }
    info!("Process complete.");
    Ok(())
}

fn check(config: &PipelineConfig, runner: &dyn ToolRunner) -> anyhow::Result<()> {
    for tool in [&config.ffmpeg, &config.ffprobe] {
        match runner.locate(tool) {
            Some(path) => println!("{:<12} ok ({})", tool, path.display()),
            None => println!("{:<12} MISSING", tool),
        }
    }
    if !config.temp_root.exists() {
        warn!("Temp root {} does not exist yet", config.temp_root.display());
    }

    let mut usable = 0;
    for &kind in &config.backends {
        match build_backend(kind, runner, config).check_available() {
            Ok(()) => {
                usable += 1;
                println!("{:<12} ok", kind.to_string());
            }
            Err(e) => println!("{:<12} unavailable: {}", kind.to_string(), e),
        }
    }

    if runner.locate(&config.ffprobe).is_none() {
        anyhow::bail!("{} is required to measure narration", config.ffprobe);
    }
    if usable == 0 {
        anyhow::bail!("no usable render backend on this machine");
    }
    Ok(())
}
