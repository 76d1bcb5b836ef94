use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::render::BackendKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub ffmpeg: String,
    pub ffprobe: String,
    /// Directory that holds every job's namespaced workspace.
    pub temp_root: PathBuf,
    pub job_timeout_secs: u64,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub crossfade_secs: f64,
    pub zoom_amount: f64,
    pub max_line_chars: usize,
    /// Backends in the order they are attempted.
    pub backends: Vec<BackendKind>,
    pub default_font: String,
    pub default_color: String,
    pub fonts: BTreeMap<String, String>,
    pub colors: BTreeMap<String, String>,
    pub video_crf: u32,
    pub video_preset: String,
    pub audio_bitrate: String,
    pub drift_tolerance_secs: f64,
    pub component: ComponentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentConfig {
    pub program: String,
    pub args: Vec<String>,
    pub entry: String,
    pub composition: String,
    /// Headless browser executables, the first one found on PATH is used.
    pub browser_candidates: Vec<String>,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            program: "npx".into(),
            args: vec!["remotion".into(), "render".into()],
            entry: "remotion/index.ts".into(),
            composition: "NarratedVideo".into(),
            browser_candidates: vec![
                "chromium".into(),
                "chromium-browser".into(),
                "google-chrome".into(),
                "chrome-headless-shell".into(),
            ],
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
            temp_root: std::env::temp_dir(),
            job_timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
            width: 1920,
            height: 1080,
            fps: Self::DEFAULT_FPS,
            crossfade_secs: Self::DEFAULT_CROSSFADE_SECS,
            zoom_amount: 0.1,
            max_line_chars: 56,
            backends: vec![
                BackendKind::Component,
                BackendKind::FilterGraph,
                BackendKind::Segmented,
            ],
            default_font: "bold-sans".into(),
            default_color: "yellow".into(),
            fonts: default_fonts(),
            colors: default_colors(),
            video_crf: 23,
            video_preset: "medium".into(),
            audio_bitrate: "192k".into(),
            drift_tolerance_secs: 0.25,
            component: ComponentConfig::default(),
        }
    }
}

fn default_fonts() -> BTreeMap<String, String> {
    [
        ("bold-sans", "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf"),
        ("sans", "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf"),
        ("serif", "/usr/share/fonts/truetype/dejavu/DejaVuSerif.ttf"),
        ("mono", "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_colors() -> BTreeMap<String, String> {
    [
        ("yellow", "yellow"),
        ("white", "white"),
        ("black", "black"),
        ("red", "red"),
        ("green", "0x22c55e"),
        ("blue", "0x3b82f6"),
        ("orange", "orange"),
        ("cyan", "cyan"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl PipelineConfig {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
    pub const DEFAULT_FPS: u32 = 30;
    pub const DEFAULT_CROSSFADE_SECS: f64 = 0.5;

    /// Loads the config at `path`, falling back to defaults when the file
    /// does not exist.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        let config: Self = toml::from_str(&contents).context("parsing pipeline config")?;
        Ok(config.sanitized())
    }

    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {}", parent.display()))?;
        }
        let toml = toml::to_string_pretty(self).context("serializing pipeline config")?;
        fs::write(path, toml)
            .with_context(|| format!("writing pipeline config to {}", path.display()))?;
        Ok(())
    }

    fn sanitized(mut self) -> Self {
        if self.job_timeout_secs == 0 {
            warn!("job_timeout_secs must be positive, using default");
            self.job_timeout_secs = Self::DEFAULT_TIMEOUT_SECS;
        }
        if self.fps == 0 {
            self.fps = Self::DEFAULT_FPS;
        }
        if !self.crossfade_secs.is_finite() || self.crossfade_secs < 0.0 {
            self.crossfade_secs = Self::DEFAULT_CROSSFADE_SECS;
        }
        if !self.zoom_amount.is_finite() || self.zoom_amount < 0.0 {
            self.zoom_amount = 0.1;
        }
        if self.max_line_chars == 0 {
            self.max_line_chars = 56;
        }
        if self.backends.is_empty() {
            self.backends = vec![BackendKind::FilterGraph, BackendKind::Segmented];
        }
        self
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::load_from_path(dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.width, 1920);
        assert_eq!(config.height, 1080);
        assert_eq!(config.job_timeout_secs, 600);
        assert_eq!(config.default_color, "yellow");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storyreel.toml");
        fs::write(
            &path,
            "job_timeout_secs = 0\nbackends = [\"segmented\"]\n\n[colors]\npink = \"0xff69b4\"\n",
        )
        .unwrap();

        let config = PipelineConfig::load_from_path(&path).unwrap();
        assert_eq!(config.job_timeout_secs, PipelineConfig::DEFAULT_TIMEOUT_SECS);
        assert_eq!(config.backends, vec![BackendKind::Segmented]);
        assert_eq!(config.colors.get("pink").map(String::as_str), Some("0xff69b4"));
        assert_eq!(config.fps, 30);
    }

    #[test]
    fn save_then_load_preserves_backend_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("storyreel.toml");
        let mut config = PipelineConfig::default();
        config.backends = vec![BackendKind::Segmented, BackendKind::FilterGraph];
        config.save_to_path(&path).unwrap();

        let loaded = PipelineConfig::load_from_path(&path).unwrap();
        assert_eq!(loaded.backends, config.backends);
    }
}
