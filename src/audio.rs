use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use hound::{SampleFormat, WavReader};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::process::{ToolInvocation, ToolRunner};

pub const CANONICAL_SAMPLE_RATE: u32 = 44_100;
pub const CANONICAL_CHANNELS: u16 = 1;
pub const CANONICAL_BITS: u16 = 16;

pub fn wav_duration_seconds(path: &Path) -> PipelineResult<f64> {
    let reader = open_wav(path)?;
    let spec = reader.spec();
    let samples = reader.len();
    let frames = samples as f64 / spec.channels as f64;
    Ok(frames / spec.sample_rate as f64)
}

/// Checks that `path` is mono 16-bit PCM at 44.1kHz and returns its length.
pub fn verify_canonical_wav(path: &Path) -> PipelineResult<f64> {
    let spec = open_wav(path)?.spec();
    if spec.channels != CANONICAL_CHANNELS
        || spec.sample_rate != CANONICAL_SAMPLE_RATE
        || spec.bits_per_sample != CANONICAL_BITS
        || spec.sample_format != SampleFormat::Int
    {
        return Err(PipelineError::AssetCorrupt {
            path: path.to_path_buf(),
            detail: format!(
                "expected mono s16 44100Hz, got {}ch {}bit {}Hz",
                spec.channels, spec.bits_per_sample, spec.sample_rate
            ),
        });
    }
    wav_duration_seconds(path)
}

fn open_wav(path: &Path) -> PipelineResult<WavReader<std::io::BufReader<File>>> {
    WavReader::open(path).map_err(|e| match e {
        hound::Error::IoError(io) if io.kind() == std::io::ErrorKind::NotFound => {
            PipelineError::AssetMissing {
                path: path.to_path_buf(),
            }
        }
        other => PipelineError::AssetCorrupt {
            path: path.to_path_buf(),
            detail: other.to_string(),
        },
    })
}

pub struct AudioAssembler<'a> {
    runner: &'a dyn ToolRunner,
    ffmpeg: &'a str,
    work_dir: &'a Path,
}

impl<'a> AudioAssembler<'a> {
    pub fn new(runner: &'a dyn ToolRunner, ffmpeg: &'a str, work_dir: &'a Path) -> Self {
        Self {
            runner,
            ffmpeg,
            work_dir,
        }
    }

    /// Returns the path of one canonical WAV holding every clip in order.
    /// A single clip is only normalized.
    pub async fn assemble(&self, clips: &[PathBuf]) -> PipelineResult<PathBuf> {
        if clips.is_empty() {
            return Err(PipelineError::InvalidJob("no audio clips to assemble".into()));
        }
        for clip in clips {
            if !clip.exists() {
                return Err(PipelineError::AssetMissing { path: clip.clone() });
            }
        }

        let combined = self.work_dir.join("narration.wav");

        if let [only] = clips {
            info!("Single narration clip, normalizing only");
            self.normalize(only, &combined).await?;
            return Ok(combined);
        }

        let mut normalized = Vec::with_capacity(clips.len());
        for (i, clip) in clips.iter().enumerate() {
            let out = self.work_dir.join(format!("norm_{:03}.wav", i));
            if let Err(e) = self.normalize(clip, &out).await {
                self.cleanup(&normalized);
                return Err(e);
            }
            normalized.push(out);
        }

        let result = self.concat(&normalized, &combined).await;
        self.cleanup(&normalized);
        result?;

        info!(
            "Concatenated {} narration clips into {}",
            clips.len(),
            combined.display()
        );
        Ok(combined)
    }

    async fn normalize(&self, input: &Path, output: &Path) -> PipelineResult<()> {
        debug!("Normalizing {} -> {}", input.display(), output.display());
        let invocation = ToolInvocation::new(self.ffmpeg)
            .args(["-y", "-v", "error", "-i"])
            .arg(input)
            .args(["-vn", "-ac"])
            .arg(CANONICAL_CHANNELS.to_string())
            .arg("-ar")
            .arg(CANONICAL_SAMPLE_RATE.to_string())
            .args(["-c:a", "pcm_s16le"])
            .arg(output);

        if let Err(e) = self.runner.run(&invocation).await {
            remove_quietly(output);
            return Err(e);
        }
        Ok(())
    }

    /// Joins canonical clips with the concat demuxer, stream-copying since
    /// every input already shares one format.
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> PipelineResult<()> {
        let list_path = self.work_dir.join("narration_list.txt");
        {
            let mut f = File::create(&list_path)?;
            for p in inputs {
                writeln!(f, "file '{}'", concat_list_escape(p))?;
            }
        }
        debug!("Created concat list file {}", list_path.display());

        let invocation = ToolInvocation::new(self.ffmpeg)
            .args(["-y", "-v", "error", "-f", "concat", "-safe", "0", "-i"])
            .arg(&list_path)
            .args(["-c", "copy"])
            .arg(output);

        let result = self.runner.run(&invocation).await;
        remove_quietly(&list_path);
        if result.is_err() {
            remove_quietly(output);
        }
        result.map(|_| ())
    }

    fn cleanup(&self, files: &[PathBuf]) {
        for f in files {
            remove_quietly(f);
        }
    }
}

pub fn concat_list_escape(path: &Path) -> String {
    path.to_string_lossy().replace('\'', "'\\''")
}

pub(crate) fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
