use std::path::Path;

use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::job::MeasuredAudioSegment;
use crate::process::{ToolInvocation, ToolRunner};

/// Measures media files with ffprobe.
pub struct DurationProber<'a> {
    runner: &'a dyn ToolRunner,
    ffprobe: &'a str,
}

impl<'a> DurationProber<'a> {
    pub fn new(runner: &'a dyn ToolRunner, ffprobe: &'a str) -> Self {
        Self { runner, ffprobe }
    }

    /// Duration of `path` in seconds. There is no fallback value: a failed
    /// or non-positive measurement is a `Probe` error.
    pub async fn probe(&self, path: &Path) -> PipelineResult<f64> {
        if !path.exists() {
            return Err(PipelineError::AssetMissing {
                path: path.to_path_buf(),
            });
        }

        let invocation = ToolInvocation::new(self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path);

        let output = self
            .runner
            .run(&invocation)
            .await
            .map_err(|err| match err {
                PipelineError::ExternalTool { stderr_tail, .. } => PipelineError::Probe {
                    path: path.to_path_buf(),
                    reason: stderr_tail,
                },
                other => other,
            })?;

        let duration = parse_duration(&output.stdout).ok_or_else(|| PipelineError::Probe {
            path: path.to_path_buf(),
            reason: format!("unparseable ffprobe output '{}'", output.stdout.trim()),
        })?;
        debug!("Probed {}: {:.3}s", path.display(), duration);
        Ok(duration)
    }

    pub async fn measure(&self, path: &Path) -> PipelineResult<MeasuredAudioSegment> {
        let duration = self.probe(path).await?;
        MeasuredAudioSegment::new(path, duration)
    }

    /// Width and height of the first video stream of an image. A file ffprobe
    /// cannot decode is reported as `AssetCorrupt`.
    pub async fn image_dimensions(&self, path: &Path) -> PipelineResult<(u32, u32)> {
        if !path.exists() {
            return Err(PipelineError::AssetMissing {
                path: path.to_path_buf(),
            });
        }

        let invocation = ToolInvocation::new(self.ffprobe)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height",
                "-of",
                "csv=s=x:p=0",
            ])
            .arg(path);

        let output = self
            .runner
            .run(&invocation)
            .await
            .map_err(|err| match err {
                PipelineError::ExternalTool { stderr_tail, .. } => PipelineError::AssetCorrupt {
                    path: path.to_path_buf(),
                    detail: stderr_tail,
                },
                other => other,
            })?;

        parse_dimensions(&output.stdout).ok_or_else(|| PipelineError::AssetCorrupt {
            path: path.to_path_buf(),
            detail: format!("no image stream in ffprobe output '{}'", output.stdout.trim()),
        })
    }
}

/// Parses a single positive duration, the only shape ffprobe prints with
/// `nokey=1`.
fn parse_duration(stdout: &str) -> Option<f64> {
    let value: f64 = stdout.lines().next()?.trim().parse().ok()?;
    (value.is_finite() && value > 0.0).then_some(value)
}

fn parse_dimensions(stdout: &str) -> Option<(u32, u32)> {
    let line = stdout.lines().next()?.trim();
    let (width, height) = line.split_once('x')?;
    let width: u32 = width.parse().ok()?;
    let height: u32 = height.parse().ok()?;
    (width > 0 && height > 0).then_some((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::render::test_support::RecordingRunner;

    #[test]
    fn parses_plain_duration() {
        assert_eq!(parse_duration("9.200000\n"), Some(9.2));
        assert_eq!(parse_duration("  11.0  "), Some(11.0));
    }

    #[test]
    fn rejects_bad_durations() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("N/A\n"), None);
        assert_eq!(parse_duration("0.000000\n"), None);
        assert_eq!(parse_duration("-3.5"), None);
        assert_eq!(parse_duration("inf"), None);
    }

    #[tokio::test]
    async fn undecodable_audio_is_a_probe_error() {
        let runner = RecordingRunner {
            fail_program: Some("ffprobe".into()),
            ..Default::default()
        };
        let prober = DurationProber::new(&runner, "ffprobe");
        let err = prober.probe(Path::new(file!())).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Probe);
        assert!(!err.allows_fallback());

        let err = prober.image_dimensions(Path::new(file!())).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AssetCorrupt);
    }

    #[test]
    fn parses_dimensions() {
        assert_eq!(parse_dimensions("1024x768\n"), Some((1024, 768)));
        assert_eq!(parse_dimensions("0x768"), None);
        assert_eq!(parse_dimensions("garbage"), None);
    }
}
