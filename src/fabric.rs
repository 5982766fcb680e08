//! fabric-ai invocation layer.
//!
//! `FabricCommand` builds argument lists for the tool; `CommandRunner` and
//! `ProcessHandle` are the seams the router and supervisor spawn through,
//! so tests can substitute mock implementations. The real implementations
//! wrap `tokio::process`.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

/// Name searched for on `$PATH` when no override is given.
pub const TOOL_NAME: &str = "fabric-ai";

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to find {TOOL_NAME} in PATH: {0}")]
    ToolNotFound(#[from] which::Error),
}

/// Resolve the executable to invoke.
///
/// Order: per-request override (must exist on disk) → `$PATH` search →
/// configured fallback (must exist on disk). The override is re-resolved
/// on every request; nothing is cached.
pub fn resolve_tool_path(
    override_path: Option<&Path>,
    fallback: Option<&Path>,
) -> Result<PathBuf, FabricError> {
    if let Some(path) = override_path {
        if path.exists() {
            return Ok(path.to_owned());
        }
        debug!(path = %path.display(), "path override does not exist, falling back to PATH search");
    }

    match which::which(TOOL_NAME) {
        Ok(path) => Ok(path),
        Err(e) => match fallback {
            Some(path) if path.exists() => Ok(path.to_owned()),
            _ => Err(e.into()),
        },
    }
}

/// Argument builder for one fabric-ai invocation.
pub struct FabricCommand<'a> {
    program: &'a Path,
    args: Vec<String>,
}

impl<'a> FabricCommand<'a> {
    pub fn new(program: &'a Path) -> Self {
        Self {
            program,
            args: Vec::new(),
        }
    }

    pub fn version(mut self) -> Self {
        self.args.push("--version".to_string());
        self
    }

    pub fn list_patterns(mut self) -> Self {
        self.args.push("--listpatterns".to_string());
        self
    }

    pub fn list_contexts(mut self) -> Self {
        self.args.push("--listcontexts".to_string());
        self
    }

    /// Line-oriented output; required for incremental streaming.
    pub fn stream(mut self) -> Self {
        self.args.push("--stream".to_string());
        self
    }

    pub fn model<S: Into<String>>(mut self, model: S) -> Self {
        self.args.push("--model".to_string());
        self.args.push(model.into());
        self
    }

    pub fn pattern<S: Into<String>>(mut self, pattern: S) -> Self {
        self.args.push("--pattern".to_string());
        self.args.push(pattern.into());
        self
    }

    pub fn context<S: Into<String>>(mut self, context: S) -> Self {
        self.args.push("--context".to_string());
        self.args.push(context.into());
        self
    }

    /// Free-form prompt, passed as a positional argument.
    pub fn custom_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.args.push(prompt.into());
        self
    }

    /// Raw argument passthrough.
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    #[cfg(test)]
    fn args(&self) -> &[String] {
        &self.args
    }

    fn build(self) -> Command {
        let mut command = Command::new(self.program);
        command.args(self.args);
        command
    }
}

/// Captured output of a single-shot invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs fabric-ai invocations against one resolved executable path.
///
/// One instance is created per request with the path resolved fresh, so a
/// settings change on the peer takes effect immediately.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    fn tool_path(&self) -> &Path;

    /// `--version` probe used by the handshake.
    async fn version(&self) -> Result<CommandOutput, FabricError>;

    /// Single-shot pattern enumeration.
    async fn list_patterns(&self) -> Result<CommandOutput, FabricError>;

    /// Single-shot context enumeration.
    async fn list_contexts(&self) -> Result<CommandOutput, FabricError>;

    /// Spawn a streaming invocation with stdin/stdout/stderr piped.
    async fn spawn_streaming(
        &self,
        command: FabricCommand<'_>,
    ) -> Result<Box<dyn ProcessHandle>, FabricError>;
}

/// One spawned child process, as seen by the supervisor.
#[async_trait]
pub trait ProcessHandle: Send {
    async fn write_stdin(&mut self, data: &[u8]) -> Result<(), FabricError>;

    async fn close_stdin(&mut self) -> Result<(), FabricError>;

    /// Next stdout line, `None` at end of stream. Lines come back without
    /// their trailing newline.
    async fn next_stdout_line(&mut self) -> Result<Option<String>, FabricError>;

    /// Wait for exit. `None` means the process was terminated by a signal.
    async fn wait(&mut self) -> Result<Option<i32>, FabricError>;

    /// Remaining stderr output, best effort. Only meaningful after exit.
    async fn stderr_output(&mut self) -> String;

    /// SIGTERM, then SIGKILL if the process has not exited within `grace`.
    async fn terminate(&mut self, grace: Duration);
}

pub struct FabricRunner {
    tool_path: PathBuf,
}

impl FabricRunner {
    pub fn new<P: Into<PathBuf>>(tool_path: P) -> Self {
        Self {
            tool_path: tool_path.into(),
        }
    }

    async fn run_single_shot(&self, command: FabricCommand<'_>) -> Result<CommandOutput, FabricError> {
        let output = command
            .build()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr)
                .trim_end()
                .to_string(),
        })
    }
}

#[async_trait]
impl CommandRunner for FabricRunner {
    fn tool_path(&self) -> &Path {
        &self.tool_path
    }

    async fn version(&self) -> Result<CommandOutput, FabricError> {
        let mut output = self
            .run_single_shot(FabricCommand::new(&self.tool_path).version())
            .await?;
        output.stdout = output.stdout.trim_end().to_string();
        Ok(output)
    }

    async fn list_patterns(&self) -> Result<CommandOutput, FabricError> {
        self.run_single_shot(FabricCommand::new(&self.tool_path).list_patterns())
            .await
    }

    async fn list_contexts(&self) -> Result<CommandOutput, FabricError> {
        self.run_single_shot(FabricCommand::new(&self.tool_path).list_contexts())
            .await
    }

    async fn spawn_streaming(
        &self,
        command: FabricCommand<'_>,
    ) -> Result<Box<dyn ProcessHandle>, FabricError> {
        let mut child = command
            .build()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        Ok(Box::new(FabricProcess {
            child,
            stdin,
            stdout_lines: stdout.map(|s| BufReader::new(s).lines()),
            stderr,
        }))
    }
}

struct FabricProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout_lines: Option<Lines<BufReader<ChildStdout>>>,
    stderr: Option<ChildStderr>,
}

#[async_trait]
impl ProcessHandle for FabricProcess {
    async fn write_stdin(&mut self, data: &[u8]) -> Result<(), FabricError> {
        if let Some(ref mut stdin) = self.stdin {
            stdin.write_all(data).await?;
        }
        Ok(())
    }

    async fn close_stdin(&mut self) -> Result<(), FabricError> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.shutdown().await?;
        }
        Ok(())
    }

    async fn next_stdout_line(&mut self) -> Result<Option<String>, FabricError> {
        match self.stdout_lines {
            Some(ref mut lines) => Ok(lines.next_line().await?),
            None => Ok(None),
        }
    }

    async fn wait(&mut self) -> Result<Option<i32>, FabricError> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    async fn stderr_output(&mut self) -> String {
        let Some(mut stderr) = self.stderr.take() else {
            return String::new();
        };
        let mut buf = Vec::new();
        if let Err(e) = stderr.read_to_end(&mut buf).await {
            warn!(error = %e, "failed to read child stderr");
        }
        String::from_utf8_lossy(&buf).trim_end().to_string()
    }

    async fn terminate(&mut self, grace: Duration) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = self.child.id().and_then(|p| i32::try_from(p).ok()) {
                let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
            }
        }

        if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
            debug!("process did not exit within grace period, killing");
            if let Err(e) = self.child.kill().await {
                warn!(error = %e, "failed to kill child process");
            }
        }
    }
}
