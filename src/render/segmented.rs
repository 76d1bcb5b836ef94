use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use super::{BackendKind, RenderBackend, RenderRequest, encode_args, ensure_output};
use crate::audio::{concat_list_escape, remove_quietly};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::process::{ToolInvocation, ToolRunner};
use crate::visual::{VisualComposer, VisualSlot};

/// Encodes one still per slot into its own clip, joins the clips with the
/// concat demuxer and burns captions while muxing the narration. Slots are
/// rendered without motion or cross-fades; slot boundaries and caption
/// windows are unchanged.
pub struct SegmentedBackend<'a> {
    runner: &'a dyn ToolRunner,
    config: &'a PipelineConfig,
    composer: VisualComposer,
}

impl<'a> SegmentedBackend<'a> {
    pub fn new(runner: &'a dyn ToolRunner, config: &'a PipelineConfig) -> Self {
        Self {
            runner,
            config,
            composer: VisualComposer::new(config),
        }
    }

    /// Frames for `slot`, taken between rounded boundaries so the clips add
    /// up to exactly the frames of the whole timeline.
    fn frame_span(&self, slot: &VisualSlot) -> u64 {
        self.composer.frame_index(slot.end_time) - self.composer.frame_index(slot.start_time)
    }

    fn segment_invocation(&self, slot: &VisualSlot, output: &Path) -> ToolInvocation {
        let fps = self.composer.fps().to_string();
        let chain = self.composer.slot_chain(
            "0:v",
            "v",
            slot.effect,
            slot.duration(),
            false,
        );
        ToolInvocation::new(&self.config.ffmpeg)
            .args(["-y", "-v", "error", "-loop", "1", "-framerate", fps.as_str(), "-i"])
            .arg(&slot.image)
            .args(["-filter_complex", chain.as_str(), "-map", "[v]", "-frames:v"])
            .arg(self.frame_span(slot).to_string())
            .args(["-c:v", "libx264", "-preset"])
            .arg(&self.config.video_preset)
            .arg("-crf")
            .arg(self.config.video_crf.to_string())
            .args(["-pix_fmt", "yuv420p", "-r", fps.as_str(), "-an"])
            .arg(output)
    }

    fn final_invocation(
        &self,
        request: &RenderRequest<'_>,
        list_path: &Path,
    ) -> ToolInvocation {
        let drawtext = request.overlay.drawtext_filters(request.captions);
        let mut invocation = ToolInvocation::new(&self.config.ffmpeg)
            .args(["-y", "-v", "error", "-f", "concat", "-safe", "0", "-i"])
            .arg(list_path)
            .arg("-i")
            .arg(request.audio);
        if !drawtext.is_empty() {
            invocation = invocation.arg("-vf").arg(drawtext.join(","));
        }
        invocation
            .args(["-map", "0:v:0", "-map", "1:a:0"])
            .args(encode_args(self.config, request.total_duration))
            .arg(request.output)
    }
}

#[async_trait]
impl RenderBackend for SegmentedBackend<'_> {
    fn kind(&self) -> BackendKind {
        BackendKind::Segmented
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

        let mut segments = Vec::with_capacity(request.slots.len());
        for slot in request.slots {
            let out = request
                .work_dir
                .join(format!("segment_{:03}.mp4", slot.image_index));
            debug!(
                "Encoding segment {} ({:.3}s) from {}",
                slot.image_index,
                slot.duration(),
                slot.image.display()
            );
            self.runner
                .run(&self.segment_invocation(slot, &out))
                .await?;
            segments.push(out);
        }
        info!("Encoded {} segments", segments.len());

        let list_path = request.work_dir.join("segments.txt");
        {
            let mut f = File::create(&list_path)?;
            for p in &segments {
                writeln!(f, "file '{}'", concat_list_escape(p))?;
            }
        }

        let result = self
            .runner
            .run(&self.final_invocation(request, &list_path))
            .await;
        remove_quietly(&list_path);
        for segment in &segments {
            remove_quietly(segment);
        }
        result?;

        ensure_output(&self.config.ffmpeg, request.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::{OverlayRenderer, TextStyle};
    use crate::render::test_support::RecordingRunner;
    use crate::subtitle::CaptionEntry;
    use crate::visual::partition;

    #[tokio::test]
    async fn encodes_one_segment_per_slot_then_concatenates() {
        let dir = tempfile::tempdir().unwrap();
        let images: Vec<PathBuf> = (0..3)
            .map(|i| {
                let p = dir.path().join(format!("img_{i}.jpg"));
                std::fs::write(&p, b"jpg").unwrap();
                p
            })
            .collect();
        let audio = dir.path().join("narration.wav");
        std::fs::write(&audio, b"wav").unwrap();
        let output = dir.path().join("render.mp4");

        let config = PipelineConfig::default();
        let runner = RecordingRunner::default();
        let backend = SegmentedBackend::new(&runner, &config);
        let overlay = OverlayRenderer::new(&config, &TextStyle::default());
        let slots = partition(&images, 30.0).unwrap();
        let captions = overlay.instructions(&[
            CaptionEntry {
                text: "First".into(),
                start_time: 0.0,
                end_time: 9.2,
            },
            CaptionEntry {
                text: "Second".into(),
                start_time: 9.2,
                end_time: 30.0,
            },
        ]);

        let request = RenderRequest {
            slots: &slots,
            audio: &audio,
            captions: &captions,
            overlay: &overlay,
            total_duration: 30.0,
            work_dir: dir.path(),
            output: &output,
        };
        backend.render(&request).await.unwrap();

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        for call in &calls[..3] {
            assert!(call.args.windows(2).any(|w| w[0] == "-frames:v" && w[1] == "300"));
            assert!(!call.args.iter().any(|a| a.contains("zoompan")));
        }
        let last = &calls[3].args;
        assert!(last.windows(2).any(|w| w[0] == "-f" && w[1] == "concat"));
        let vf = last.iter().position(|a| a == "-vf").unwrap();
        assert!(last[vf + 1].contains("lt(t\\,9.200)"));
        assert!(last[vf + 1].contains("gte(t\\,9.200)"));

        assert!(!dir.path().join("segments.txt").exists());
        assert!(!dir.path().join("segment_000.mp4").exists());
        assert!(output.exists());
    }

    #[test]
    fn segment_frames_add_up_to_the_timeline() {
        let images: Vec<PathBuf> = (0..7).map(|i| PathBuf::from(format!("img_{i}.png"))).collect();
        let config = PipelineConfig::default();
        let runner = RecordingRunner::default();
        let backend = SegmentedBackend::new(&runner, &config);
        let slots = partition(&images, 9.2).unwrap();

        let spans: Vec<u64> = slots.iter().map(|s| backend.frame_span(s)).collect();
        assert_eq!(spans, vec![39, 40, 39, 40, 39, 40, 39]);
        assert_eq!(spans.iter().sum::<u64>(), 276);

        let mut elapsed = 0;
        for (slot, span) in slots.iter().zip(&spans) {
            // Each clip starts on the frame nearest its slot start.
            assert!((elapsed as f64 / 30.0 - slot.start_time).abs() <= 0.5 / 30.0);
            elapsed += span;
        }

        let invocation = backend.segment_invocation(&slots[1], Path::new("segment_001.mp4"));
        assert!(invocation.args.windows(2).any(|w| w[0] == "-frames:v" && w[1] == "40"));
        assert!(!invocation.args.iter().any(|a| a == "-t"));
    }

    #[tokio::test]
    async fn failed_segment_stops_the_render() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("img.png");
        std::fs::write(&image, b"png").unwrap();
        let audio = dir.path().join("narration.wav");
        std::fs::write(&audio, b"wav").unwrap();
        let output = dir.path().join("render.mp4");

        let config = PipelineConfig::default();
        let runner = RecordingRunner {
            fail_program: Some("ffmpeg".into()),
            ..Default::default()
        };
        let backend = SegmentedBackend::new(&runner, &config);
        let overlay = OverlayRenderer::new(&config, &TextStyle::default());
        let slots = partition(&[image], 4.0).unwrap();
        let request = RenderRequest {
            slots: &slots,
            audio: &audio,
            captions: &[],
            overlay: &overlay,
            total_duration: 4.0,
            work_dir: dir.path(),
            output: &output,
        };
        let err = backend.render(&request).await.unwrap_err();
        assert!(err.allows_fallback());
        assert_eq!(runner.calls.lock().unwrap().len(), 1);
    }
}
