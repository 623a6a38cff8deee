use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use tokio::process::Child;
use tokio::time::Instant;
use tokio_stream::{Stream, StreamExt};

use crate::runner::secret::{redact, Secret};

pub(crate) type ByteLines = Pin<Box<dyn Stream<Item = std::io::Result<Vec<u8>>> + Send>>;

/// How an external process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    /// Exited with a non-zero code.
    Failed(i32),
    /// Killed by a signal.
    Terminated,
    /// Exceeded its time bound and was killed.
    TimedOut,
    /// The executable could not be started.
    LaunchFailed,
}

impl ExitOutcome {
    pub fn success(self) -> bool {
        matches!(self, ExitOutcome::Success)
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitOutcome::Success => write!(f, "exit code 0"),
            ExitOutcome::Failed(code) => write!(f, "exit code {code}"),
            ExitOutcome::Terminated => write!(f, "terminated by signal"),
            ExitOutcome::TimedOut => write!(f, "timed out"),
            ExitOutcome::LaunchFailed => write!(f, "launch failed"),
        }
    }
}

/// Lazy, finite sequence of text lines from a process's combined stdout and
/// stderr.
///
/// Lines are decoded as they arrive (invalid UTF-8 is replaced, trailing
/// whitespace trimmed, registered secrets masked). Once both streams close
/// the process is awaited; a non-zero exit adds one final
/// `command exited with code N` line. The sequence is not restartable.
pub struct OutputLines {
    program: String,
    lines: Option<ByteLines>,
    child: Option<Child>,
    pending: VecDeque<String>,
    deadline: Option<Instant>,
    timeout: Duration,
    secrets: Vec<Secret>,
    outcome: Option<ExitOutcome>,
}

impl std::fmt::Debug for OutputLines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputLines")
            .field("program", &self.program)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

impl OutputLines {
    pub(crate) fn streaming(
        program: String,
        lines: ByteLines,
        child: Child,
        deadline: Option<Instant>,
        timeout: Duration,
        secrets: Vec<Secret>,
    ) -> Self {
        Self {
            program,
            lines: Some(lines),
            child: Some(child),
            pending: VecDeque::new(),
            deadline,
            timeout,
            secrets,
            outcome: None,
        }
    }

    pub(crate) fn launch_failed(program: String, error: &std::io::Error) -> Self {
        let mut pending = VecDeque::new();
        pending.push_back(format!("error: failed to launch {program}: {error}"));
        Self {
            program,
            lines: None,
            child: None,
            pending,
            deadline: None,
            timeout: Duration::ZERO,
            secrets: Vec::new(),
            outcome: Some(ExitOutcome::LaunchFailed),
        }
    }

    /// Next line of output, or `None` once the process has ended and every
    /// line (including the exit report) has been yielded.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(line);
            }

            if let Some(lines) = self.lines.as_mut() {
                let next = match self.deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, lines.next()).await {
                        Ok(item) => item,
                        Err(_) => {
                            self.kill_after_timeout().await;
                            continue;
                        }
                    },
                    None => lines.next().await,
                };

                match next {
                    Some(Ok(bytes)) => return Some(self.decode(&bytes)),
                    Some(Err(e)) => {
                        tracing::warn!(program = %self.program, error = %e, "Output read failed, closing stream");
                        self.lines = None;
                    }
                    None => self.lines = None,
                }
                continue;
            }

            if let Some(mut child) = self.child.take() {
                let status = match self.deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            self.child = Some(child);
                            self.kill_after_timeout().await;
                            continue;
                        }
                    },
                    None => child.wait().await,
                };

                let outcome = match status {
                    Ok(status) if status.success() => ExitOutcome::Success,
                    Ok(status) => match status.code() {
                        Some(code) => {
                            self.pending
                                .push_back(format!("command exited with code {code}"));
                            ExitOutcome::Failed(code)
                        }
                        None => {
                            self.pending
                                .push_back("command terminated by signal".to_string());
                            ExitOutcome::Terminated
                        }
                    },
                    Err(e) => {
                        self.pending
                            .push_back(format!("error: failed to wait for {}: {e}", self.program));
                        ExitOutcome::Terminated
                    }
                };
                tracing::debug!(program = %self.program, outcome = ?outcome, "Process finished");
                self.outcome = Some(outcome);
                continue;
            }

            return None;
        }
    }

    /// Final outcome, available once [`next_line`](Self::next_line) has
    /// returned `None`.
    pub fn outcome(&self) -> Option<ExitOutcome> {
        self.outcome
    }

    fn decode(&self, bytes: &[u8]) -> String {
        let text = String::from_utf8_lossy(bytes);
        redact(text.trim_end(), &self.secrets)
    }

    async fn kill_after_timeout(&mut self) {
        tracing::warn!(program = %self.program, timeout = ?self.timeout, "Process timed out, killing");
        self.lines = None;
        self.deadline = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!(program = %self.program, error = %e, "Failed to kill timed out process");
            }
        }
        self.pending
            .push_back(format!("command timed out after {:?}", self.timeout));
        self.outcome = Some(ExitOutcome::TimedOut);
    }
}
