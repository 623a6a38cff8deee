//! Process Runner: launches one external command and streams its output.
//!
//! Commands are argv-style ([`CommandSpec`]), never shell strings. Output is
//! read line by line as it arrives through [`OutputLines`], so memory use is
//! bounded by line length rather than by the size of an output burst.
//!
//! # Failure reporting
//!
//! Nothing here returns an error for a process that ran. A non-zero exit
//! becomes a final `command exited with code N` line and
//! [`ExitOutcome::Failed`]; an executable that cannot be started becomes a
//! single `error: failed to launch ...` line and
//! [`ExitOutcome::LaunchFailed`].
//!
//! # Secrets
//!
//! Bytes written to stdin are never echoed: they are registered for
//! redaction along with any extra secrets on the spec. Argument lists are
//! never logged, only the program name.

pub mod lines;
pub mod secret;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::SplitStream;
use tokio_stream::StreamExt;

pub use lines::{ExitOutcome, OutputLines};
pub use secret::{redact, Secret};

/// Description of one external command.
#[derive(Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Written to the process's stdin, then stdin is closed.
    pub stdin: Option<Secret>,
    /// Extra values masked in every output line.
    pub redact: Vec<Secret>,
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for CommandSpec {
    // Arguments may embed credentials (clone URLs), so only their count is shown.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args.len())
            .field("cwd", &self.cwd)
            .field("stdin", &self.stdin.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            stdin: None,
            redact: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: Secret) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn redact(mut self, secret: Secret) -> Self {
        self.redact.push(secret);
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.kill_on_drop(true);
        cmd
    }

    fn secrets(&self) -> Vec<Secret> {
        let mut secrets = self.redact.clone();
        if let Some(ref input) = self.stdin {
            let trimmed = input.expose().trim();
            if !trimmed.is_empty() {
                secrets.push(Secret::new(trimmed));
            }
        }
        secrets
    }
}

fn feed_stdin(child: &mut tokio::process::Child, input: Option<&Secret>, program: &str) {
    let (Some(input), Some(mut stdin)) = (input.cloned(), child.stdin.take()) else {
        return;
    };
    let program = program.to_string();
    // Written from a separate task so a process that talks before reading
    // cannot deadlock against a full pipe.
    tokio::spawn(async move {
        if let Err(e) = stdin.write_all(input.expose().as_bytes()).await {
            tracing::debug!(program = %program, error = %e, "Failed to write stdin");
        }
        if let Err(e) = stdin.shutdown().await {
            tracing::debug!(program = %program, error = %e, "Failed to close stdin");
        }
    });
}

/// Launch `spec` and return its combined output as a lazy line sequence.
pub fn spawn(spec: &CommandSpec) -> OutputLines {
    tracing::debug!(program = %spec.program, cwd = ?spec.cwd, "Spawning process");

    let mut cmd = spec.command();
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(program = %spec.program, error = %e, "Failed to launch process");
            return OutputLines::launch_failed(spec.program.clone(), &e);
        }
    };

    feed_stdin(&mut child, spec.stdin.as_ref(), &spec.program);

    let stdout = child
        .stdout
        .take()
        .map(|out| SplitStream::new(BufReader::new(out).split(b'\n')));
    let stderr = child
        .stderr
        .take()
        .map(|err| SplitStream::new(BufReader::new(err).split(b'\n')));

    let merged: lines::ByteLines = match (stdout, stderr) {
        (Some(out), Some(err)) => Box::pin(out.merge(err)),
        (Some(out), None) => Box::pin(out),
        (None, Some(err)) => Box::pin(err),
        (None, None) => Box::pin(tokio_stream::empty()),
    };

    let deadline = spec.timeout.map(|t| tokio::time::Instant::now() + t);
    OutputLines::streaming(
        spec.program.clone(),
        merged,
        child,
        deadline,
        spec.timeout.unwrap_or_default(),
        spec.secrets(),
    )
}

/// Run `spec` to completion and return its trimmed stdout when it exits
/// successfully with non-empty output.
///
/// Meant for short auxiliary calls (token helpers): stderr is discarded and
/// every failure, including the time bound, is reported as `None`.
pub async fn capture_stdout(spec: &CommandSpec) -> Option<String> {
    let mut cmd = spec.command();
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::null());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::debug!(program = %spec.program, error = %e, "Helper not available");
            return None;
        }
    };
    feed_stdin(&mut child, spec.stdin.as_ref(), &spec.program);

    let output = match spec.timeout {
        Some(timeout) => match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output,
            Err(_) => {
                tracing::warn!(program = %spec.program, timeout = ?timeout, "Helper timed out");
                return None;
            }
        },
        None => child.wait_with_output().await,
    };

    match output {
        Ok(output) if output.status.success() => {
            let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
        Ok(output) => {
            tracing::debug!(program = %spec.program, code = ?output.status.code(), "Helper failed");
            None
        }
        Err(e) => {
            tracing::debug!(program = %spec.program, error = %e, "Helper failed");
            None
        }
    }
}
