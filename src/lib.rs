pub mod audio;
pub mod collab;
pub mod config;
pub mod error;
pub mod job;
pub mod overlay;
pub mod pipeline;
pub mod probe;
pub mod process;
pub mod render;
pub mod subtitle;
pub mod visual;
pub mod workspace;

pub use config::PipelineConfig;
pub use error::{ErrorKind, PipelineError, PipelineResult};
pub use job::{JobStatus, RenderJob};
pub use pipeline::{JobOutcome, Orchestrator};
