mod component;
mod filtergraph;
mod segmented;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use component::ComponentBackend;
pub use filtergraph::FilterGraphBackend;
pub use segmented::SegmentedBackend;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::overlay::{OverlayInstruction, OverlayRenderer};
use crate::process::ToolRunner;
use crate::visual::VisualSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum BackendKind {
    Component,
    FilterGraph,
    Segmented,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Component => write!(f, "component"),
            BackendKind::FilterGraph => write!(f, "filter_graph"),
            BackendKind::Segmented => write!(f, "segmented"),
        }
    }
}

pub struct RenderRequest<'a> {
    pub slots: &'a [VisualSlot],
    pub audio: &'a Path,
    pub captions: &'a [OverlayInstruction],
    pub overlay: &'a OverlayRenderer,
    pub total_duration: f64,
    pub work_dir: &'a Path,
    /// Where the backend writes its file. The orchestrator moves it to the
    /// caller's path only after success.
    pub output: &'a Path,
}

impl RenderRequest<'_> {
    pub fn check_inputs(&self) -> PipelineResult<()> {
        if !self.audio.exists() {
            return Err(PipelineError::AssetMissing {
                path: self.audio.to_path_buf(),
            });
        }
        for slot in self.slots {
            if !slot.image.exists() {
                return Err(PipelineError::AssetMissing {
                    path: slot.image.clone(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
pub trait RenderBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn check_available(&self) -> PipelineResult<()>;

    async fn render(&self, request: &RenderRequest<'_>) -> PipelineResult<PathBuf>;
}

pub fn build_backend<'a>(
    kind: BackendKind,
    runner: &'a dyn ToolRunner,
    config: &'a PipelineConfig,
) -> Box<dyn RenderBackend + 'a> {
    match kind {
        BackendKind::Component => Box::new(ComponentBackend::new(runner, config)),
        BackendKind::FilterGraph => Box::new(FilterGraphBackend::new(runner, config)),
        BackendKind::Segmented => Box::new(SegmentedBackend::new(runner, config)),
    }
}

/// H.264/AAC output settings shared by the ffmpeg backends. `-t` pins the
/// container to the narration length.
pub(crate) fn encode_args(config: &PipelineConfig, total_duration: f64) -> Vec<String> {
    vec![
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        config.video_preset.clone(),
        "-crf".into(),
        config.video_crf.to_string(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-r".into(),
        config.fps.to_string(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        config.audio_bitrate.clone(),
        "-movflags".into(),
        "+faststart".into(),
        "-t".into(),
        format!("{:.3}", total_duration),
    ]
}

pub(crate) fn ensure_output(tool: &str, output: &Path) -> PipelineResult<PathBuf> {
    match std::fs::metadata(output) {
        Ok(meta) if meta.len() > 0 => Ok(output.to_path_buf()),
        _ => Err(PipelineError::ExternalTool {
            tool: tool.to_string(),
            code: Some(0),
            stderr_tail: format!("no output written to {}", output.display()),
        }),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::{PipelineError, PipelineResult};
    use crate::process::{ToolInvocation, ToolOutput, ToolRunner};

    /// Records invocations and writes a stub file for every `.mp4` argument
    /// that does not exist yet.
    #[derive(Default)]
    pub struct RecordingRunner {
        pub calls: Mutex<Vec<ToolInvocation>>,
        pub missing: Vec<String>,
        pub fail_program: Option<String>,
    }

    #[async_trait]
    impl ToolRunner for RecordingRunner {
        async fn run(&self, invocation: &ToolInvocation) -> PipelineResult<ToolOutput> {
            self.calls.lock().unwrap().push(invocation.clone());
            if self.fail_program.as_deref() == Some(invocation.program.as_str()) {
                return Err(PipelineError::ExternalTool {
                    tool: invocation.program.clone(),
                    code: Some(1),
                    stderr_tail: "boom".into(),
                });
            }
            for arg in &invocation.args {
                let path = Path::new(arg);
                if arg.ends_with(".mp4") && !path.exists() {
                    std::fs::write(path, b"stub").unwrap();
                }
            }
            Ok(ToolOutput::default())
        }

        fn locate(&self, program: &str) -> Option<PathBuf> {
            (!self.missing.iter().any(|m| m == program))
                .then(|| Path::new("/usr/bin").join(program))
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::ValueEnum;

    use super::*;

    #[test]
    fn cli_names_match_display_names() {
        for kind in BackendKind::value_variants() {
            let value = kind.to_possible_value().unwrap();
            assert_eq!(value.get_name(), kind.to_string());
        }
        assert_eq!(
            BackendKind::from_str("filter_graph", false),
            Ok(BackendKind::FilterGraph)
        );
    }
}
