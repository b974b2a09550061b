//! Collaborators that do the actual work of a task.
//!
//! The scheduler only knows the [`CodeGenerator`], [`Verifier`] and
//! [`Sandbox`] traits. The shell-backed implementations here run a
//! configured command per task inside the sandbox root.

use crate::core::task::Task;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Default timeout for a single generator or verifier command (2 minutes).
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;

/// What a generator reports back for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOutput {
    pub success: bool,
    pub files_modified: Vec<PathBuf>,
    /// False when the generator's own checks rejected its output.
    pub verification_passed: bool,
    pub exports: Vec<String>,
    pub error: Option<String>,
}

impl Default for GenerationOutput {
    fn default() -> Self {
        Self {
            success: false,
            files_modified: Vec::new(),
            verification_passed: true,
            exports: Vec::new(),
            error: None,
        }
    }
}

impl GenerationOutput {
    pub fn success(files_modified: Vec<PathBuf>) -> Self {
        Self {
            success: true,
            files_modified,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Result of an incremental check over touched files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub passed: bool,
    pub diagnostics: Vec<String>,
}

impl VerificationReport {
    pub fn pass() -> Self {
        Self {
            passed: true,
            diagnostics: Vec::new(),
        }
    }

    pub fn fail(diagnostics: Vec<String>) -> Self {
        Self {
            passed: false,
            diagnostics,
        }
    }

    /// Diagnostics joined into one error message.
    pub fn summary(&self) -> String {
        if self.diagnostics.is_empty() {
            "verification failed".to_string()
        } else {
            self.diagnostics.join("; ")
        }
    }
}

/// Produces the file(s) for a task.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Run one attempt of `task`. `claimed` lists the paths the task holds.
    ///
    /// An `Err` is treated like an unsuccessful output: the attempt fails.
    async fn execute(&self, task: &Task, claimed: &[PathBuf]) -> Result<GenerationOutput>;
}

/// Checks touched files after generation.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, files: &[PathBuf]) -> Result<VerificationReport>;
}

/// The environment tasks run in.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Fails with [`Error::Infrastructure`] when the sandbox cannot be used.
    async fn ensure_ready(&self) -> Result<()>;
}

// ========== Shell implementations ==========

/// Runs a shell command per task.
///
/// The task is written to stdin as JSON and described by the `KILN_TASK_ID`,
/// `KILN_TASK_FILE` and `KILN_TASK_TYPE` environment variables. If stdout is
/// a JSON [`GenerationOutput`] it is used as-is; otherwise the exit status
/// decides and the task's own file counts as modified.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    command: String,
    root: PathBuf,
    timeout: Duration,
}

impl CommandGenerator {
    pub fn new(command: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            root: root.into(),
            timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    async fn run(&self, task: &Task) -> Result<std::process::Output> {
        let payload = serde_json::to_vec(task)?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.root)
            .env("KILN_TASK_ID", task.id.as_str())
            .env("KILN_TASK_FILE", &task.file_path)
            .env("KILN_TASK_TYPE", task.task_type.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Feed stdin while draining stdout and stderr so neither pipe fills up.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // Commands that ignore stdin may close it early.
                let _ = stdin.write_all(&payload).await;
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        Ok(output?)
    }
}

#[async_trait]
impl CodeGenerator for CommandGenerator {
    async fn execute(&self, task: &Task, _claimed: &[PathBuf]) -> Result<GenerationOutput> {
        tracing::debug!(task_id = %task.id, command = %self.command, "running generator");
        let output = tokio::time::timeout(self.timeout, self.run(task))
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Ok(parsed) = serde_json::from_str::<GenerationOutput>(stdout.trim()) {
            return Ok(parsed);
        }

        if output.status.success() {
            Ok(GenerationOutput::success(vec![task.file_path.clone()]))
        } else {
            Ok(GenerationOutput::failure(failure_message(&output)))
        }
    }
}

/// Runs a check command with the touched files appended as arguments.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    command: String,
    root: PathBuf,
    timeout: Duration,
}

impl CommandVerifier {
    pub fn new(command: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            root: root.into(),
            timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Verifier for CommandVerifier {
    async fn verify(&self, files: &[PathBuf]) -> Result<VerificationReport> {
        let script = format!("{} \"$@\"", self.command);
        let output = tokio::time::timeout(
            self.timeout,
            Command::new("sh")
                .arg("-c")
                .arg(&script)
                .arg("kiln-verify")
                .args(files)
                .current_dir(&self.root)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))??;

        if output.status.success() {
            return Ok(VerificationReport::pass());
        }

        let diagnostics: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&output.stderr).lines())
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        Ok(VerificationReport::fail(diagnostics))
    }
}

/// Accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopVerifier;

#[async_trait]
impl Verifier for NoopVerifier {
    async fn verify(&self, _files: &[PathBuf]) -> Result<VerificationReport> {
        Ok(VerificationReport::pass())
    }
}

/// A directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    root: PathBuf,
}

impl LocalSandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn ensure_ready(&self) -> Result<()> {
        let metadata = tokio::fs::metadata(&self.root).await.map_err(|e| {
            Error::Infrastructure(format!(
                "sandbox root {} unavailable: {}",
                self.root.display(),
                e
            ))
        })?;
        if !metadata.is_dir() {
            return Err(Error::Infrastructure(format!(
                "sandbox root {} is not a directory",
                self.root.display()
            )));
        }
        Ok(())
    }
}

fn failure_message(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.trim().is_empty() {
        format!(
            "command exited with code {}",
            output.status.code().unwrap_or(-1)
        )
    } else {
        stderr.trim().to_string()
    }
}
