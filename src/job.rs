use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::overlay::TextStyle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptSegment {
    pub text: String,
    #[serde(default)]
    pub image_prompt: String,
    /// Seconds the script generator aimed for. Never used for timing.
    #[serde(default)]
    pub planned_duration: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Image,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub kind: AssetKind,
    pub locator: String,
    pub index: usize,
}

impl MediaAsset {
    pub fn image(locator: impl Into<String>, index: usize) -> Self {
        Self {
            kind: AssetKind::Image,
            locator: locator.into(),
            index,
        }
    }

    pub fn audio(locator: impl Into<String>, index: usize) -> Self {
        Self {
            kind: AssetKind::Audio,
            locator: locator.into(),
            index,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.locator.starts_with("http://") || self.locator.starts_with("https://")
    }

    pub fn local_path(&self) -> &Path {
        Path::new(&self.locator)
    }
}

/// An audio clip whose duration came from probing the file itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasuredAudioSegment {
    pub path: PathBuf,
    pub measured_duration: f64,
}

impl MeasuredAudioSegment {
    pub fn new(path: impl Into<PathBuf>, measured_duration: f64) -> PipelineResult<Self> {
        let path = path.into();
        if !(measured_duration.is_finite() && measured_duration > 0.0) {
            return Err(PipelineError::Probe {
                path,
                reason: format!("non-positive duration {measured_duration}"),
            });
        }
        Ok(Self {
            path,
            measured_duration,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalStatus {
    Pending,
    Generating,
    Editing,
    Compiling,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Probing,
    AssemblingAudio,
    ComposingVisual,
    Rendering,
    Completed,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::TimedOut
        )
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Probing)
            | (Probing, AssemblingAudio)
            | (AssemblingAudio, ComposingVisual)
            | (ComposingVisual, Rendering)
            | (Rendering, Completed)
            | (Rendering, TimedOut) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn external(self) -> ExternalStatus {
        match self {
            JobStatus::Pending => ExternalStatus::Pending,
            JobStatus::Probing | JobStatus::AssemblingAudio => ExternalStatus::Editing,
            JobStatus::ComposingVisual | JobStatus::Rendering => ExternalStatus::Compiling,
            JobStatus::Completed => ExternalStatus::Completed,
            JobStatus::Failed | JobStatus::TimedOut => ExternalStatus::Failed,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Probing => "probing",
            JobStatus::AssemblingAudio => "assembling_audio",
            JobStatus::ComposingVisual => "composing_visual",
            JobStatus::Rendering => "rendering",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub error_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderJob {
    pub id: Uuid,
    pub segments: Vec<ScriptSegment>,
    pub audio: Vec<MediaAsset>,
    pub images: Vec<MediaAsset>,
    #[serde(default)]
    pub style: TextStyle,
    pub output_path: PathBuf,
    /// Sum of measured audio durations, known once probing finished.
    #[serde(skip)]
    pub total_duration: Option<f64>,
    #[serde(skip)]
    pub status: JobStatus,
    #[serde(skip)]
    pub failure: Option<JobFailure>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobManifest {
    pub segments: Vec<ScriptSegment>,
    pub audio: Vec<String>,
    pub images: Vec<String>,
    #[serde(default)]
    pub style: TextStyle,
}

impl RenderJob {
    pub fn new(
        segments: Vec<ScriptSegment>,
        audio: Vec<MediaAsset>,
        images: Vec<MediaAsset>,
        style: TextStyle,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            segments,
            audio,
            images,
            style,
            output_path: output_path.into(),
            total_duration: None,
            status: JobStatus::Pending,
            failure: None,
        }
    }

    pub fn from_manifest(manifest: JobManifest, output_path: impl Into<PathBuf>) -> Self {
        let audio = manifest
            .audio
            .into_iter()
            .enumerate()
            .map(|(i, locator)| MediaAsset::audio(locator, i))
            .collect();
        let images = manifest
            .images
            .into_iter()
            .enumerate()
            .map(|(i, locator)| MediaAsset::image(locator, i))
            .collect();
        Self::new(manifest.segments, audio, images, manifest.style, output_path)
    }

    pub fn namespace(&self) -> String {
        format!("storyreel-{}", self.id.simple())
    }

    /// Moves the job to `next`, rejecting transitions the state machine does
    /// not allow.
    pub fn transition(&mut self, next: JobStatus) -> PipelineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::InvalidJob(format!(
                "illegal status transition {} -> {}",
                self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.status = JobStatus::Pending;
        self.failure = None;
        self.total_duration = None;
    }

    pub fn validate(&mut self) -> PipelineResult<()> {
        if self.segments.is_empty() {
            return Err(PipelineError::InvalidJob("job has no script segments".into()));
        }
        if self.images.is_empty() {
            return Err(PipelineError::InvalidJob("job has no images".into()));
        }
        if self.audio.len() != self.segments.len() {
            return Err(PipelineError::InvalidJob(format!(
                "{} script segments but {} audio clips",
                self.segments.len(),
                self.audio.len()
            )));
        }
        if self.images.len() != self.segments.len() {
            warn!(
                "{} script segments but {} images; visual slots follow the images",
                self.segments.len(),
                self.images.len()
            );
        }
        ensure_sequential(&mut self.audio, AssetKind::Audio)?;
        ensure_sequential(&mut self.images, AssetKind::Image)?;
        Ok(())
    }
}

fn ensure_sequential(assets: &mut [MediaAsset], kind: AssetKind) -> PipelineResult<()> {
    assets.sort_by_key(|a| a.index);
    for (expected, asset) in assets.iter().enumerate() {
        if asset.kind != kind {
            return Err(PipelineError::InvalidJob(format!(
                "asset {} has kind {:?}, expected {:?}",
                asset.locator, asset.kind, kind
            )));
        }
        if asset.index != expected {
            return Err(PipelineError::InvalidJob(format!(
                "{:?} assets are not indexed 0..{}: found index {} at position {}",
                kind,
                assets.len(),
                asset.index,
                expected
            )));
        }
    }
    Ok(())
}
