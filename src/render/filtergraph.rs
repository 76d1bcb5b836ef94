use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use super::{BackendKind, RenderBackend, RenderRequest, encode_args, ensure_output};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::process::{ToolInvocation, ToolRunner};
use crate::visual::VisualComposer;

/// Renders everything in one ffmpeg pass: every still is an input, the
/// filter graph applies pan/zoom, cross-fades and captions.
pub struct FilterGraphBackend<'a> {
    runner: &'a dyn ToolRunner,
    config: &'a PipelineConfig,
    composer: VisualComposer,
}

impl<'a> FilterGraphBackend<'a> {
    pub fn new(runner: &'a dyn ToolRunner, config: &'a PipelineConfig) -> Self {
        Self {
            runner,
            config,
            composer: VisualComposer::new(config),
        }
    }

    pub fn build_invocation(&self, request: &RenderRequest<'_>) -> ToolInvocation {
        let plan = self.composer.fade_plan(request.slots);
        let fps = self.composer.fps().to_string();

        let mut invocation = ToolInvocation::new(&self.config.ffmpeg).args(["-y", "-v", "error"]);
        for (slot, span) in request.slots.iter().zip(&plan.spans) {
            invocation = invocation
                .args(["-loop", "1", "-framerate", fps.as_str(), "-t"])
                .arg(format!("{:.3}", span.input_duration))
                .arg("-i")
                .arg(&slot.image);
        }
        let audio_index = request.slots.len();
        invocation = invocation.arg("-i").arg(request.audio);

        let mut filters: Vec<String> = request
            .slots
            .iter()
            .zip(&plan.spans)
            .enumerate()
            .map(|(i, (slot, span))| {
                self.composer.slot_chain(
                    &format!("{i}:v"),
                    &format!("s{i}"),
                    slot.effect,
                    span.input_duration,
                    true,
                )
            })
            .collect();
        filters.push(self.composer.join_chain(&plan, "vbase"));

        let drawtext = request.overlay.drawtext_filters(request.captions);
        let video_label = if drawtext.is_empty() {
            "[vbase]".to_string()
        } else {
            filters.push(format!("[vbase]{}[vout]", drawtext.join(",")));
            "[vout]".to_string()
        };

        invocation
            .arg("-filter_complex")
            .arg(filters.join(";"))
            .args(["-map", video_label.as_str(), "-map"])
            .arg(format!("{audio_index}:a:0"))
            .args(encode_args(self.config, request.total_duration))
            .arg(request.output)
    }
}

#[async_trait]
impl RenderBackend for FilterGraphBackend<'_> {
    fn kind(&self) -> BackendKind {
        BackendKind::FilterGraph
    }

    fn check_available(&self) -> PipelineResult<()> {
        if self.runner.is_available(&self.config.ffmpeg) {
            Ok(())
        } else {
            Err(PipelineError::DependencyUnavailable {
                backend: self.kind().to_string(),
                missing: format!("{} not found on PATH", self.config.ffmpeg),
            })
        }
    }

    async fn render(&self, request: &RenderRequest<'_>) -> PipelineResult<PathBuf> {
        request.check_inputs()?;
        info!(
            "Rendering {} slots and {} caption lines in a single pass",
            request.slots.len(),
            request.captions.len()
        );
        let invocation = self.build_invocation(request);
        self.runner.run(&invocation).await?;
        ensure_output(&self.config.ffmpeg, request.output)
    }
}
