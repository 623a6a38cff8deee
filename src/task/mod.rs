//! Task execution: specifications, step sequences and the slot-bounded
//! executor.
//!
//! # Components
//!
//! - [`TaskSpec`]: immutable description of a build or deploy
//! - [`TaskExecutor`]: acquires an Execution Slot, prepares a workspace,
//!   runs the step sequence and records state transitions
//! - `build` / `deploy`: the step sequences, each with a dry-run twin that
//!   never launches a process
//! - `auth`: registry login strategies used before a push
//!
//! # State machine
//!
//! `queued -> running -> done | error`. Every failure inside a task is
//! turned into log lines plus the `error` state at the executor boundary.

mod auth;
mod build;
mod deploy;
pub mod executor;
pub mod spec;

pub use build::DRY_RUN_BUILD_COMPLETE;
pub use deploy::DRY_RUN_DEPLOY_COMPLETE;
pub use executor::TaskExecutor;
pub use spec::{default_tag, BuildSpec, CredentialUrl, DeploySpec, TaskSpec};

use crate::config::ServiceConfig;
use crate::runner::{self, CommandSpec, ExitOutcome};
use crate::store::SharedJobStore;

/// Log sink for one job. Store failures are swallowed by the store itself.
pub(crate) struct JobLog {
    store: SharedJobStore,
    id: String,
}

impl JobLog {
    pub(crate) fn new(store: SharedJobStore, id: impl Into<String>) -> Self {
        Self {
            store,
            id: id.into(),
        }
    }

    pub(crate) async fn line(&self, line: impl AsRef<str>) {
        self.store.append_log(&self.id, line.as_ref()).await;
    }

    /// Run `spec` and persist each output line as it arrives.
    pub(crate) async fn run(&self, spec: &CommandSpec) -> ExitOutcome {
        self.run_inspecting(spec, |_| {}).await
    }

    /// Like [`run`](Self::run), also handing every line to `inspect`.
    pub(crate) async fn run_inspecting(
        &self,
        spec: &CommandSpec,
        mut inspect: impl FnMut(&str),
    ) -> ExitOutcome {
        let mut output = runner::spawn(spec);
        while let Some(line) = output.next_line().await {
            inspect(&line);
            self.line(&line).await;
        }
        output.outcome().unwrap_or(ExitOutcome::Terminated)
    }
}

/// Everything a step sequence needs besides its own specification.
pub(crate) struct StepContext<'a> {
    pub config: &'a ServiceConfig,
    pub log: &'a JobLog,
}

impl StepContext<'_> {
    /// Command for a required step, bounded by the step timeout.
    pub(crate) fn step(&self, program: &str) -> CommandSpec {
        CommandSpec::new(program).timeout(self.config.timeouts.step)
    }

    /// Command for an auxiliary call, bounded by the helper timeout.
    pub(crate) fn helper(&self, program: &str) -> CommandSpec {
        CommandSpec::new(program).timeout(Some(self.config.timeouts.helper))
    }

    /// Pause between simulated steps.
    pub(crate) async fn dry_run_pause(&self) {
        tokio::time::sleep(self.config.timeouts.dry_run_step_delay).await;
    }
}
