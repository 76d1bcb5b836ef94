use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::USER_AGENT;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::audio::{AudioAssembler, remove_quietly, verify_canonical_wav};
use crate::collab::{CreditLedger, ImageGenerator, ScriptGenerator, SpeechSynthesizer, StatusSink};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::job::{AssetKind, ExternalStatus, JobFailure, JobStatus, MediaAsset, RenderJob};
use crate::overlay::{OverlayRenderer, TextStyle};
use crate::probe::DurationProber;
use crate::process::ToolRunner;
use crate::render::{BackendKind, RenderRequest, build_backend};
use crate::subtitle::{CaptionEntry, build_captions};
use crate::visual::{VisualComposer, VisualSlot};
use crate::workspace::JobWorkspace;

const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub output_path: PathBuf,
    pub total_duration: f64,
    pub captions: Vec<CaptionEntry>,
    pub backend: BackendKind,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub topic: String,
    pub duration_secs: u32,
    pub language: String,
    pub voice_style: String,
    pub image_style: String,
    pub cost: u32,
    pub output_path: PathBuf,
}

pub struct AssetSources<'a> {
    pub script: &'a dyn ScriptGenerator,
    pub images: &'a dyn ImageGenerator,
    pub speech: &'a dyn SpeechSynthesizer,
    pub credits: &'a dyn CreditLedger,
}

pub struct Orchestrator {
    config: PipelineConfig,
    runner: Arc<dyn ToolRunner>,
    status: Arc<dyn StatusSink>,
    http: reqwest::Client,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        runner: Arc<dyn ToolRunner>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            config,
            runner,
            status,
            http: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn generate_assets(
        &self,
        request: &GenerationRequest,
        sources: &AssetSources<'_>,
    ) -> PipelineResult<RenderJob> {
        if !sources.credits.has_balance(request.cost).await? {
            return Err(PipelineError::collaborator(
                "credit ledger",
                format!("insufficient balance for a job costing {}", request.cost),
            ));
        }

        let style = TextStyle {
            font: self.config.default_font.clone(),
            color: self.config.default_color.clone(),
        };
        let mut job = RenderJob::new(
            Vec::new(),
            Vec::new(),
            Vec::new(),
            style,
            &request.output_path,
        );
        self.status
            .report(job.id, ExternalStatus::Generating, None)
            .await;

        let generated = self.generate_into(&mut job, request, sources).await;
        if let Err(err) = generated {
            error!("Asset generation for job {} failed: {}", job.id, err);
            self.status
                .report(job.id, ExternalStatus::Failed, Some(&err.to_string()))
                .await;
            return Err(err);
        }
        Ok(job)
    }

    async fn generate_into(
        &self,
        job: &mut RenderJob,
        request: &GenerationRequest,
        sources: &AssetSources<'_>,
    ) -> PipelineResult<()> {
        info!(
            "Generating a {}s script about '{}'",
            request.duration_secs, request.topic
        );
        job.segments = sources
            .script
            .generate_script(&request.topic, request.duration_secs, &request.language)
            .await?;
        if job.segments.is_empty() {
            return Err(PipelineError::collaborator(
                "script generator",
                "returned an empty script",
            ));
        }

        for (i, segment) in job.segments.iter().enumerate() {
            let locator = sources
                .images
                .generate_image(&segment.image_prompt, &request.image_style)
                .await?;
            job.images.push(MediaAsset::image(locator, i));

            let clip = sources
                .speech
                .synthesize(&segment.text, &request.voice_style, &request.language)
                .await?;
            job.audio
                .push(MediaAsset::audio(clip.to_string_lossy().into_owned(), i));
            debug!("Generated assets for segment {}", i);
        }
        info!("Generated {} segments", job.segments.len());
        Ok(())
    }

    pub async fn run_job(&self, job: &mut RenderJob) -> PipelineResult<JobOutcome> {
        if job.status != JobStatus::Pending {
            return Err(PipelineError::InvalidJob(format!(
                "job {} is {}, expected pending",
                job.id, job.status
            )));
        }
        info!("Starting job {}", job.id);

        let workspace = match JobWorkspace::create(&self.config.temp_root, &job.namespace()) {
            Ok(ws) => ws,
            Err(err) => {
                self.fail(job, &err).await;
                return Err(err);
            }
        };

        let limit = self.config.job_timeout();
        let timed = timeout(limit, self.run_stages(job, &workspace)).await;
        let result = match timed {
            Ok(result) => result,
            Err(_) => {
                error!("Job {} hit its {}s limit during {}", job.id, limit.as_secs(), job.status);
                Err(PipelineError::Timeout { after: limit })
            }
        };
        workspace.close();

        match result {
            Ok(outcome) => {
                self.advance(job, JobStatus::Completed).await?;
                info!(
                    "Job {} completed: {} ({:.3}s, {} backend)",
                    job.id,
                    outcome.output_path.display(),
                    outcome.total_duration,
                    outcome.backend
                );
                Ok(outcome)
            }
            Err(err) => {
                self.fail(job, &err).await;
                Err(err)
            }
        }
    }

    pub async fn run_with_retry(
        &self,
        job: &mut RenderJob,
        max_attempts: u32,
    ) -> PipelineResult<JobOutcome> {
        if job.status.is_terminal() {
            job.reset();
        }
        let mut attempt = 1;
        loop {
            match self.run_job(job).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    warn!(
                        "Attempt {}/{} of job {} failed ({}), retrying",
                        attempt, max_attempts, job.id, err
                    );
                    sleep(RETRY_DELAY * attempt).await;
                    job.reset();
                    self.status.report(job.id, ExternalStatus::Pending, None).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn run_stages(
        &self,
        job: &mut RenderJob,
        workspace: &JobWorkspace,
    ) -> PipelineResult<JobOutcome> {
        job.validate()?;
        let runner = self.runner.as_ref();
        let prober = DurationProber::new(runner, &self.config.ffprobe);

        self.advance(job, JobStatus::Probing).await?;
        let mut clips = Vec::with_capacity(job.audio.len());
        for asset in &job.audio {
            clips.push(self.fetch(asset, workspace).await?);
        }
        let mut durations = Vec::with_capacity(clips.len());
        for clip in &clips {
            let measured = prober.measure(clip).await?;
            durations.push(measured.measured_duration);
        }
        let total: f64 = durations.iter().sum();
        job.total_duration = Some(total);
        info!(
            "Measured {} narration clips, {:.3}s in total",
            durations.len(),
            total
        );

        self.advance(job, JobStatus::AssemblingAudio).await?;
        let narration = AudioAssembler::new(runner, &self.config.ffmpeg, workspace.path())
            .assemble(&clips)
            .await?;
        let assembled = verify_canonical_wav(&narration)?;
        if (assembled - total).abs() > self.config.drift_tolerance_secs {
            warn!(
                "Assembled narration is {:.3}s but clips measured {:.3}s; timing follows the measured clips",
                assembled, total
            );
        }

        self.advance(job, JobStatus::ComposingVisual).await?;
        let mut images = Vec::with_capacity(job.images.len());
        for asset in &job.images {
            images.push(self.fetch(asset, workspace).await?);
        }
        let slots = VisualComposer::new(&self.config)
            .compose(&prober, &images, total)
            .await?;
        let captions = build_captions(&job.segments, &durations)?;
        let overlay = OverlayRenderer::new(&self.config, &job.style);

        self.advance(job, JobStatus::Rendering).await?;
        let (backend, rendered) = self
            .render_with_fallback(&slots, &narration, &captions, &overlay, total, workspace)
            .await?;
        move_file(&rendered, &job.output_path).await?;

        Ok(JobOutcome {
            output_path: job.output_path.clone(),
            total_duration: total,
            captions,
            backend,
        })
    }

    /// Tries each configured backend in order. Only a missing dependency or
    /// a failed encoder run moves on to the next one.
    async fn render_with_fallback(
        &self,
        slots: &[VisualSlot],
        narration: &Path,
        captions: &[CaptionEntry],
        overlay: &OverlayRenderer,
        total: f64,
        workspace: &JobWorkspace,
    ) -> PipelineResult<(BackendKind, PathBuf)> {
        let instructions = overlay.instructions(captions);
        let mut last_error = None;

        for &kind in &self.config.backends {
            let backend = build_backend(kind, self.runner.as_ref(), &self.config);
            let output = workspace.file(&format!("render_{kind}.mp4"));
            let request = RenderRequest {
                slots,
                audio: narration,
                captions: &instructions,
                overlay,
                total_duration: total,
                work_dir: workspace.path(),
                output: &output,
            };

            let attempt = match backend.check_available() {
                Ok(()) => backend.render(&request).await,
                Err(err) => Err(err),
            };
            match attempt {
                Ok(path) => return Ok((kind, path)),
                Err(err) if err.allows_fallback() => {
                    warn!("{} backend failed: {}", kind, err);
                    remove_quietly(&output);
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error
            .unwrap_or_else(|| PipelineError::InvalidJob("no render backends configured".into())))
    }

    async fn fetch(&self, asset: &MediaAsset, workspace: &JobWorkspace) -> PipelineResult<PathBuf> {
        if !asset.is_remote() {
            let path = asset.local_path();
            if !path.exists() {
                return Err(PipelineError::AssetMissing {
                    path: path.to_path_buf(),
                });
            }
            return Ok(path.to_path_buf());
        }

        let (stem, default_ext) = match asset.kind {
            AssetKind::Image => ("image", "png"),
            AssetKind::Audio => ("audio", "wav"),
        };
        let ext = remote_extension(&asset.locator).unwrap_or(default_ext);
        let dest = workspace.file(&format!("{}_{:03}.{}", stem, asset.index, ext));

        info!("Downloading {}", asset.locator);
        let bytes = self
            .http
            .get(&asset.locator)
            .header(USER_AGENT, concat!("storyreel/", env!("CARGO_PKG_VERSION")))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        tokio::fs::write(&dest, &bytes).await?;
        debug!("Saved {} bytes to {}", bytes.len(), dest.display());
        Ok(dest)
    }

    async fn advance(&self, job: &mut RenderJob, next: JobStatus) -> PipelineResult<()> {
        let previous = job.status;
        job.transition(next)?;
        debug!("Job {}: {} -> {}", job.id, previous, next);
        if previous.external() != next.external() {
            self.status.report(job.id, next.external(), None).await;
        }
        Ok(())
    }

    /// Records `err` on the job. A timeout while rendering ends in
    /// `timed_out`; everything else, including a timeout in an earlier
    /// stage, ends in `failed` with the error kind preserved.
    async fn fail(&self, job: &mut RenderJob, err: &PipelineError) {
        let terminal = match err {
            PipelineError::Timeout { .. } if job.status == JobStatus::Rendering => {
                JobStatus::TimedOut
            }
            _ => JobStatus::Failed,
        };
        if let Err(e) = job.transition(terminal) {
            warn!("Could not record failure on job {}: {}", job.id, e);
        }
        let message = err.to_string();
        job.failure = Some(JobFailure {
            kind: err.kind(),
            error_message: message.clone(),
        });
        error!("Job {} {}: {}", job.id, job.status, message);
        self.status
            .report(job.id, job.status.external(), Some(&message))
            .await;
    }
}

fn remote_extension(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    (!ext.is_empty() && ext.len() <= 4 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .then_some(ext)
}

async fn move_file(from: &Path, to: &Path) -> PipelineResult<()> {
    let parent = to
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    tokio::fs::create_dir_all(parent).await?;
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    copy_into_place(from, to, parent).await?;
    remove_quietly(from);
    Ok(())
}

/// Copies `from` to a hidden sibling of `to`, then renames it over `to`.
/// The staged file is deleted if the copy fails or the future is dropped.
async fn copy_into_place(from: &Path, to: &Path, parent: &Path) -> PipelineResult<()> {
    let staged = tempfile::Builder::new()
        .prefix(".storyreel-")
        .suffix(".part")
        .tempfile_in(parent)?;
    tokio::fs::copy(from, staged.path()).await?;
    staged.persist(to).map_err(|e| PipelineError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_from_url() {
        assert_eq!(remote_extension("https://cdn.example.com/a/img.jpg?sig=1"), Some("jpg"));
        assert_eq!(remote_extension("https://cdn.example.com/a/img"), None);
        assert_eq!(remote_extension("https://example.com/x.toolongext"), None);
    }

    #[tokio::test]
    async fn move_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("render.mp4");
        std::fs::write(&from, b"mp4").unwrap();
        let to = dir.path().join("out/nested/final.mp4");
        move_file(&from, &to).await.unwrap();
        assert!(!from.exists());
        assert_eq!(std::fs::read(&to).unwrap(), b"mp4");
    }

    fn staged_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .count()
    }

    #[tokio::test]
    async fn copy_replaces_target_in_one_step() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("render.mp4");
        std::fs::write(&from, b"full render").unwrap();
        let to = dir.path().join("final.mp4");
        std::fs::write(&to, b"old").unwrap();

        copy_into_place(&from, &to, dir.path()).await.unwrap();

        assert_eq!(std::fs::read(&to).unwrap(), b"full render");
        assert_eq!(staged_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn failed_copy_leaves_nothing_at_target() {
        let dir = tempfile::tempdir().unwrap();
        let to = dir.path().join("final.mp4");

        let err = copy_into_place(&dir.path().join("gone.mp4"), &to, dir.path())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
        assert!(!to.exists());
        assert_eq!(staged_files(dir.path()), 0);
    }
}
