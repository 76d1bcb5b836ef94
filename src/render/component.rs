use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use super::{BackendKind, RenderBackend, RenderRequest, ensure_output};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::process::{ToolInvocation, ToolRunner};

/// Input props handed to the component composition.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompositionProps<'a> {
    width: u32,
    height: u32,
    fps: u32,
    duration_in_frames: u64,
    audio: &'a Path,
    slots: Vec<SlotProps<'a>>,
    captions: Vec<CaptionProps<'a>>,
    font_file: &'a str,
    color: &'a str,
    font_size: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SlotProps<'a> {
    image: &'a Path,
    from_frame: u64,
    duration_in_frames: u64,
    effect: Option<&'static str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CaptionProps<'a> {
    text: &'a str,
    start: f64,
    end: f64,
}

/// Drives a component-based renderer that draws each frame in a headless
/// browser. Needs the renderer CLI, its project entry point and a browser.
pub struct ComponentBackend<'a> {
    runner: &'a dyn ToolRunner,
    config: &'a PipelineConfig,
}

impl<'a> ComponentBackend<'a> {
    pub fn new(runner: &'a dyn ToolRunner, config: &'a PipelineConfig) -> Self {
        Self { runner, config }
    }

    fn browser(&self) -> Option<PathBuf> {
        self.config
            .component
            .browser_candidates
            .iter()
            .find_map(|candidate| self.runner.locate(candidate))
    }

    fn unavailable(&self, missing: String) -> PipelineError {
        PipelineError::DependencyUnavailable {
            backend: self.kind().to_string(),
            missing,
        }
    }

    fn frames(&self, seconds: f64) -> u64 {
        (seconds * self.config.fps as f64).round() as u64
    }

    fn props_json(&self, request: &RenderRequest<'_>) -> PipelineResult<String> {
        let style = request.overlay.style();
        let slots = request
            .slots
            .iter()
            .map(|slot| {
                let from_frame = self.frames(slot.start_time);
                SlotProps {
                    image: &slot.image,
                    from_frame,
                    duration_in_frames: self.frames(slot.end_time) - from_frame,
                    effect: slot.effect.direction(),
                }
            })
            .collect();
        let captions = request
            .captions
            .iter()
            .map(|c| CaptionProps {
                text: &c.text,
                start: c.start_time,
                end: c.end_time,
            })
            .collect();

        let props = CompositionProps {
            width: self.config.width,
            height: self.config.height,
            fps: self.config.fps,
            duration_in_frames: self.frames(request.total_duration),
            audio: request.audio,
            slots,
            captions,
            font_file: &style.font_file,
            color: &style.color,
            font_size: style.font_size,
        };
        Ok(serde_json::to_string_pretty(&props)?)
    }
}

#[async_trait]
impl RenderBackend for ComponentBackend<'_> {
    fn kind(&self) -> BackendKind {
        BackendKind::Component
    }

    fn check_available(&self) -> PipelineResult<()> {
        let component = &self.config.component;
        if !self.runner.is_available(&component.program) {
            return Err(self.unavailable(format!("{} not found on PATH", component.program)));
        }
        if !Path::new(&component.entry).exists() {
            return Err(self.unavailable(format!(
                "composition entry {} does not exist",
                component.entry
            )));
        }
        if self.browser().is_none() {
            return Err(self.unavailable(format!(
                "no headless browser found (tried {})",
                component.browser_candidates.join(", ")
            )));
        }
        Ok(())
    }

    async fn render(&self, request: &RenderRequest<'_>) -> PipelineResult<PathBuf> {
        request.check_inputs()?;
        let browser = self
            .browser()
            .ok_or_else(|| self.unavailable("no headless browser found".into()))?;

        let props_path = request.work_dir.join("composition_props.json");
        tokio::fs::write(&props_path, self.props_json(request)?).await?;

        let component = &self.config.component;
        let invocation = ToolInvocation::new(&component.program)
            .args(&component.args)
            .arg(&component.entry)
            .arg(&component.composition)
            .arg(request.output)
            .arg(format!("--props={}", props_path.display()))
            .arg(format!("--browser-executable={}", browser.display()))
            .arg("--codec=h264");

        info!(
            "Rendering {} slots with the component renderer ({})",
            request.slots.len(),
            browser.display()
        );
        self.runner.run(&invocation).await?;
        ensure_output(&component.program, request.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::{OverlayRenderer, TextStyle};
    use crate::render::test_support::RecordingRunner;
    use crate::subtitle::CaptionEntry;
    use crate::visual::partition;

    #[test]
    fn unavailable_without_browser() {
        let mut config = PipelineConfig::default();
        config.component.entry = file!().to_string();
        let runner = RecordingRunner {
            missing: config.component.browser_candidates.clone(),
            ..Default::default()
        };
        let backend = ComponentBackend::new(&runner, &config);
        let err = backend.check_available().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DependencyUnavailable);
        assert!(err.is_retryable());
    }

    #[test]
    fn unavailable_without_entry_point() {
        let mut config = PipelineConfig::default();
        config.component.entry = "/nonexistent/remotion/index.ts".into();
        let runner = RecordingRunner::default();
        let backend = ComponentBackend::new(&runner, &config);
        assert!(backend.check_available().is_err());
    }

    #[tokio::test]
    async fn writes_props_with_frame_accurate_slots() {
        let dir = tempfile::tempdir().unwrap();
        let images: Vec<PathBuf> = (0..2)
            .map(|i| {
                let p = dir.path().join(format!("img_{i}.png"));
                std::fs::write(&p, b"png").unwrap();
                p
            })
            .collect();
        let audio = dir.path().join("narration.wav");
        std::fs::write(&audio, b"wav").unwrap();
        let output = dir.path().join("render.mp4");

        let config = PipelineConfig::default();
        let runner = RecordingRunner::default();
        let backend = ComponentBackend::new(&runner, &config);
        let overlay = OverlayRenderer::new(&config, &TextStyle::default());
        let slots = partition(&images, 20.0).unwrap();
        let captions = overlay.instructions(&[CaptionEntry {
            text: "Hi <b>there</b>".into(),
            start_time: 0.0,
            end_time: 20.0,
        }]);
        let request = RenderRequest {
            slots: &slots,
            audio: &audio,
            captions: &captions,
            overlay: &overlay,
            total_duration: 20.0,
            work_dir: dir.path(),
            output: &output,
        };
        backend.render(&request).await.unwrap();

        let props: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("composition_props.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(props["durationInFrames"], 600);
        assert_eq!(props["slots"][1]["fromFrame"], 300);
        assert_eq!(props["slots"][1]["durationInFrames"], 300);
        assert_eq!(props["slots"][0]["effect"], "in");
        assert_eq!(props["captions"][0]["text"], "Hi there");

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].program, "npx");
        assert!(calls[0].args.iter().any(|a| a.starts_with("--browser-executable=")));
    }
}
