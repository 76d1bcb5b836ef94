use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error};

use crate::error::{PipelineError, PipelineResult};

/// Lines of stderr kept on an `ExternalTool` error.
pub const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string_lossy().into_owned());
        }
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// The last argument, which for ffmpeg invocations is the output file.
    pub fn output_path(&self) -> Option<&Path> {
        self.args.last().map(Path::new)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs external programs. Every call is a suspension point; the pipeline
/// does not continue until exit status and stderr are available.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, invocation: &ToolInvocation) -> PipelineResult<ToolOutput>;

    /// Resolves `program` on PATH.
    fn locate(&self, program: &str) -> Option<PathBuf>;

    fn is_available(&self, program: &str) -> bool {
        self.locate(program).is_some()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemToolRunner;

#[async_trait]
impl ToolRunner for SystemToolRunner {
    async fn run(&self, invocation: &ToolInvocation) -> PipelineResult<ToolOutput> {
        debug!("Running {} {}", invocation.program, invocation.args.join(" "));

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.current_dir {
            command.current_dir(dir);
        }

        let output = command.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PipelineError::DependencyUnavailable {
                    backend: invocation.program.clone(),
                    missing: format!("{} is not installed or not on PATH", invocation.program),
                }
            } else {
                PipelineError::Io(e)
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            error!(
                "{} exited with status {:?}",
                invocation.program,
                output.status.code()
            );
            return Err(PipelineError::ExternalTool {
                tool: invocation.program.clone(),
                code: output.status.code(),
                stderr_tail: stderr_tail(&stderr, STDERR_TAIL_LINES),
            });
        }

        Ok(ToolOutput { stdout, stderr })
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

/// Last `max_lines` non-empty lines of `stderr`, joined with newlines.
pub fn stderr_tail(stderr: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = stderr
        .split(['\r', '\n'])
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_last_lines() {
        let stderr = "one\ntwo\r\nthree\n\nfour\n";
        assert_eq!(stderr_tail(stderr, 2), "three\nfour");
        assert_eq!(stderr_tail(stderr, 10), "one\ntwo\nthree\nfour");
        assert_eq!(stderr_tail("", 3), "");
    }

    #[test]
    fn invocation_builder_collects_args() {
        let inv = ToolInvocation::new("ffmpeg")
            .arg("-y")
            .args(["-i", "in.wav"])
            .arg(Path::new("out.wav"));
        assert_eq!(inv.args, vec!["-y", "-i", "in.wav", "out.wav"]);
        assert_eq!(inv.output_path(), Some(Path::new("out.wav")));
    }

    #[tokio::test]
    async fn missing_program_is_dependency_unavailable() {
        let runner = SystemToolRunner;
        let err = runner
            .run(&ToolInvocation::new("storyreel-definitely-not-installed"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DependencyUnavailable);
        assert!(!runner.is_available("storyreel-definitely-not-installed"));
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr_tail() {
        let err = SystemToolRunner
            .run(&ToolInvocation::new("sh").args(["-c", "echo 'bad input' >&2; exit 3"]))
            .await
            .unwrap_err();
        match err {
            PipelineError::ExternalTool {
                code, stderr_tail, ..
            } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr_tail, "bad input");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn timed_out_child_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("sleep 1; touch '{}'", marker.display());
        let invocation = ToolInvocation::new("sh").args(["-c", script.as_str()]);

        let runner = SystemToolRunner;
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            runner.run(&invocation),
        )
        .await;
        assert!(result.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
