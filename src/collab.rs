use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::job::{ExternalStatus, ScriptSegment};
use crate::process::stderr_tail;

#[async_trait]
pub trait ScriptGenerator: Send + Sync {
    async fn generate_script(
        &self,
        topic: &str,
        duration_secs: u32,
        language: &str,
    ) -> PipelineResult<Vec<ScriptSegment>>;
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Returns a URL or local path for the generated image.
    async fn generate_image(&self, prompt: &str, style: &str) -> PipelineResult<String>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice_style: &str,
        language: &str,
    ) -> PipelineResult<PathBuf>;
}

#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn report(&self, job_id: Uuid, status: ExternalStatus, error_message: Option<&str>);
}

#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn has_balance(&self, cost: u32) -> PipelineResult<bool>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusSink;

#[async_trait]
impl StatusSink for LogStatusSink {
    async fn report(&self, job_id: Uuid, status: ExternalStatus, error_message: Option<&str>) {
        match error_message {
            Some(msg) => error!("Job {} is {:?}: {}", job_id, status, msg),
            None => info!("Job {} is {:?}", job_id, status),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedCredits;

#[async_trait]
impl CreditLedger for UnlimitedCredits {
    async fn has_balance(&self, _cost: u32) -> PipelineResult<bool> {
        Ok(true)
    }
}

static SENTENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)([^.!?]+[.!?]+)|([^.!?]+$)").expect("valid regex"));

/// Groups sentences into chunks of at most `max_chars`. A sentence longer
/// than `max_chars` becomes its own chunk.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let sentences: Vec<&str> = SENTENCE
        .find_iter(text)
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .collect();
    if sentences.is_empty() {
        warn!("No sentence breaks found; returning whole text as one chunk");
        let trimmed = text.trim();
        return if trimmed.is_empty() {
            Vec::new()
        } else {
            vec![trimmed.to_string()]
        };
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for s in sentences {
        if current.is_empty() {
            current.push_str(s);
        } else if current.len() + 1 + s.len() <= max_chars {
            current.push(' ');
            current.push_str(s);
        } else {
            chunks.push(std::mem::take(&mut current));
            current.push_str(s);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

const FALLBACK_TEMPLATES: [&str; 8] = [
    "Today we take a closer look at {topic}.",
    "At first glance, {topic} seems simple.",
    "But there is more to {topic} than most people realize.",
    "Experts have studied {topic} for years.",
    "Some of their findings are genuinely surprising.",
    "Understanding {topic} changes how we see the world around us.",
    "There is still a lot left to discover.",
    "Thanks for watching, and stay curious about {topic}.",
];

/// Deterministic script generator used when the model-backed one is out of
/// quota. Multi-sentence topics are chunked as-is; short topics are expanded
/// from fixed templates, one segment per ten seconds (three to eight).
#[derive(Debug, Clone)]
pub struct OfflineScriptGenerator {
    pub chunk_chars: usize,
}

impl Default for OfflineScriptGenerator {
    fn default() -> Self {
        Self { chunk_chars: 250 }
    }
}

#[async_trait]
impl ScriptGenerator for OfflineScriptGenerator {
    async fn generate_script(
        &self,
        topic: &str,
        duration_secs: u32,
        _language: &str,
    ) -> PipelineResult<Vec<ScriptSegment>> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(PipelineError::collaborator("script generator", "empty topic"));
        }

        let mut texts = chunk_text(topic, self.chunk_chars);
        if texts.len() < 2 {
            let count = (duration_secs / 10).clamp(3, 8) as usize;
            let subject = topic.trim_end_matches(['.', '!', '?']);
            texts = FALLBACK_TEMPLATES
                .iter()
                .take(count)
                .map(|t| t.replace("{topic}", subject))
                .collect();
        }

        let planned = duration_secs.max(1) as f64 / texts.len() as f64;
        Ok(texts
            .into_iter()
            .map(|text| ScriptSegment {
                image_prompt: format!("Illustration: {}", text),
                text,
                planned_duration: planned,
            })
            .collect())
    }
}

/// Uses `primary` and switches to the offline generator when it reports a
/// quota or rate-limit error.
pub struct FallbackScriptGenerator<P> {
    primary: P,
    offline: OfflineScriptGenerator,
}

impl<P: ScriptGenerator> FallbackScriptGenerator<P> {
    pub fn new(primary: P) -> Self {
        Self {
            primary,
            offline: OfflineScriptGenerator::default(),
        }
    }
}

#[async_trait]
impl<P: ScriptGenerator> ScriptGenerator for FallbackScriptGenerator<P> {
    async fn generate_script(
        &self,
        topic: &str,
        duration_secs: u32,
        language: &str,
    ) -> PipelineResult<Vec<ScriptSegment>> {
        match self.primary.generate_script(topic, duration_secs, language).await {
            Err(PipelineError::Collaborator {
                quota_exceeded: true,
                message,
                ..
            }) => {
                warn!("Script generator out of quota ({}), using offline script", message);
                self.offline
                    .generate_script(topic, duration_secs, language)
                    .await
            }
            other => other,
        }
    }
}

#[derive(Debug)]
pub struct LocalImageLibrary {
    images: Vec<PathBuf>,
    next: AtomicUsize,
}

impl LocalImageLibrary {
    pub fn open(dir: &Path) -> PipelineResult<Self> {
        let mut images: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| {
                        matches!(
                            e.to_ascii_lowercase().as_str(),
                            "png" | "jpg" | "jpeg" | "webp" | "bmp"
                        )
                    })
                    .unwrap_or(false)
            })
            .collect();
        images.sort();
        if images.is_empty() {
            return Err(PipelineError::AssetMissing {
                path: dir.to_path_buf(),
            });
        }
        Ok(Self {
            images,
            next: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ImageGenerator for LocalImageLibrary {
    async fn generate_image(&self, prompt: &str, _style: &str) -> PipelineResult<String> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.images.len();
        debug!("Image {} for prompt '{}'", self.images[i].display(), prompt);
        Ok(self.images[i].to_string_lossy().into_owned())
    }
}

/// Piper text-to-speech. Text goes in on stdin, one WAV per call.
#[derive(Debug)]
pub struct PiperSynthesizer {
    program: String,
    model: PathBuf,
    out_dir: PathBuf,
    counter: AtomicUsize,
}

impl PiperSynthesizer {
    pub fn new(model: impl Into<PathBuf>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: "piper".into(),
            model: model.into(),
            out_dir: out_dir.into(),
            counter: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for PiperSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        voice_style: &str,
        _language: &str,
    ) -> PipelineResult<PathBuf> {
        let i = self.counter.fetch_add(1, Ordering::Relaxed);
        let out_path = self.out_dir.join(format!("part_{:03}.wav", i));
        let model = if voice_style.is_empty() {
            self.model.clone()
        } else {
            PathBuf::from(voice_style)
        };
        info!("Calling Piper TTS for output file {}", out_path.display());

        let mut child = Command::new(&self.program)
            .arg("--model")
            .arg(&model)
            .arg("--output_file")
            .arg(&out_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PipelineError::collaborator("text-to-speech", format!("failed to spawn piper: {e}"))
            })?;

        // Piper may fill its stderr pipe before it drains stdin, so the
        // text is fed while the output is being collected.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(text.as_bytes()).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());

        let output = output?;
        if !output.status.success() {
            error!("Piper TTS command failed for chunk: {}", out_path.display());
            return Err(PipelineError::collaborator(
                "text-to-speech",
                stderr_tail(&String::from_utf8_lossy(&output.stderr), 5),
            ));
        }
        fed?;
        Ok(out_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_respect_sentence_boundaries() {
        let text = "First sentence. Second one! Third? Trailing words";
        assert_eq!(
            chunk_text(text, 30),
            vec!["First sentence. Second one!", "Third? Trailing words"]
        );
        assert_eq!(chunk_text(text, 1000).len(), 1);
        assert!(chunk_text("   ", 10).is_empty());
    }

    #[tokio::test]
    async fn offline_generator_is_deterministic() {
        let generator = OfflineScriptGenerator::default();
        let a = generator.generate_script("black holes", 60, "en").await.unwrap();
        let b = generator.generate_script("black holes", 60, "en").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 6);
        assert!(a[0].text.contains("black holes"));
        assert!((a.iter().map(|s| s.planned_duration).sum::<f64>() - 60.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn offline_generator_chunks_long_topics() {
        let generator = OfflineScriptGenerator { chunk_chars: 20 };
        let script = generator
            .generate_script("Cats sleep a lot. They also purr loudly.", 20, "en")
            .await
            .unwrap();
        assert_eq!(script.len(), 2);
        assert_eq!(script[1].text, "They also purr loudly.");
    }

    struct OutOfQuota;

    #[async_trait]
    impl ScriptGenerator for OutOfQuota {
        async fn generate_script(
            &self,
            _topic: &str,
            _duration_secs: u32,
            _language: &str,
        ) -> PipelineResult<Vec<ScriptSegment>> {
            Err(PipelineError::quota_exceeded("script generator", "429 Too Many Requests"))
        }
    }

    struct Broken;

    #[async_trait]
    impl ScriptGenerator for Broken {
        async fn generate_script(
            &self,
            _topic: &str,
            _duration_secs: u32,
            _language: &str,
        ) -> PipelineResult<Vec<ScriptSegment>> {
            Err(PipelineError::collaborator("script generator", "bad response"))
        }
    }

    #[tokio::test]
    async fn quota_errors_switch_to_offline_script() {
        let script = FallbackScriptGenerator::new(OutOfQuota)
            .generate_script("volcanoes", 30, "en")
            .await
            .unwrap();
        assert_eq!(script.len(), 3);

        let err = FallbackScriptGenerator::new(Broken)
            .generate_script("volcanoes", 30, "en")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Collaborator);
    }

    #[tokio::test]
    async fn image_library_cycles_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.jpg", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let library = LocalImageLibrary::open(dir.path()).unwrap();
        let picks = [
            library.generate_image("p", "").await.unwrap(),
            library.generate_image("p", "").await.unwrap(),
            library.generate_image("p", "").await.unwrap(),
        ];
        assert!(picks[0].ends_with("a.jpg"));
        assert!(picks[1].ends_with("b.png"));
        assert_eq!(picks[0], picks[2]);
    }

    fn piper_stub(dir: &Path, body: &str) -> PiperSynthesizer {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("piper");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        PiperSynthesizer {
            program: script.to_string_lossy().into_owned(),
            model: dir.join("voice.onnx"),
            out_dir: dir.to_path_buf(),
            counter: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn piper_chatter_on_stderr_does_not_stall() {
        let dir = tempfile::tempdir().unwrap();
        // $4 is the --output_file value.
        let piper = piper_stub(
            dir.path(),
            r#"head -c 200000 /dev/zero >&2; cat > /dev/null; echo RIFF > "$4""#,
        );
        let text = "A long sentence for the narrator. ".repeat(6000);

        let path = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            piper.synthesize(&text, "", "en"),
        )
        .await
        .expect("synthesis stalled")
        .unwrap();
        assert!(path.ends_with("part_000.wav"));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn piper_failure_carries_its_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let piper = piper_stub(dir.path(), "echo 'model not found' >&2; exit 2");

        let err = piper.synthesize("Hello.", "", "en").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Collaborator);
        assert!(err.to_string().contains("model not found"));
    }
}
