use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Programmatic error kind, preserved on failed jobs so callers can decide
/// whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AssetMissing,
    AssetCorrupt,
    Probe,
    ExternalTool,
    Timeout,
    DependencyUnavailable,
    InvalidJob,
    Collaborator,
    Io,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::DependencyUnavailable)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("asset not found: {}", path.display())]
    AssetMissing { path: PathBuf },

    #[error("asset {} could not be decoded: {detail}", path.display())]
    AssetCorrupt { path: PathBuf, detail: String },

    #[error("could not measure duration of {}: {reason}", path.display())]
    Probe { path: PathBuf, reason: String },

    #[error("{tool} exited with status {code:?}: {stderr_tail}")]
    ExternalTool {
        tool: String,
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("job exceeded its {}s time limit", after.as_secs())]
    Timeout { after: Duration },

    #[error("{backend} backend unavailable: {missing}")]
    DependencyUnavailable { backend: String, missing: String },

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
        quota_exceeded: bool,
    },

    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::AssetMissing { .. } => ErrorKind::AssetMissing,
            PipelineError::AssetCorrupt { .. } => ErrorKind::AssetCorrupt,
            PipelineError::Probe { .. } => ErrorKind::Probe,
            PipelineError::ExternalTool { .. } => ErrorKind::ExternalTool,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
            PipelineError::DependencyUnavailable { .. } => ErrorKind::DependencyUnavailable,
            PipelineError::InvalidJob(_) => ErrorKind::InvalidJob,
            PipelineError::Collaborator { .. } => ErrorKind::Collaborator,
            PipelineError::Download(_) => ErrorKind::AssetMissing,
            PipelineError::Io(_) | PipelineError::Serialization(_) => ErrorKind::Io,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Whether the orchestrator may try the next render backend after this
    /// error instead of failing the job.
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::DependencyUnavailable | ErrorKind::ExternalTool
        )
    }

    pub fn collaborator(collaborator: &'static str, message: impl Into<String>) -> Self {
        PipelineError::Collaborator {
            collaborator,
            message: message.into(),
            quota_exceeded: false,
        }
    }

    pub fn quota_exceeded(collaborator: &'static str, message: impl Into<String>) -> Self {
        PipelineError::Collaborator {
            collaborator,
            message: message.into(),
            quota_exceeded: true,
        }
    }
}
