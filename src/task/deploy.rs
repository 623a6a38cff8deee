use std::path::PathBuf;

use crate::error::{DockhandError, Result};
use crate::task::spec::DeploySpec;
use crate::task::StepContext;
use crate::workspace::Workspace;

/// Final line of a simulated deploy.
pub const DRY_RUN_DEPLOY_COMPLETE: &str = "[dry_run] deploy complete";

const EXTRA_VARS_FILE: &str = "extra_vars.json";

/// Run the playbook with the image mapping as external input data.
pub(crate) async fn run(ctx: &StepContext<'_>, deploy: &DeploySpec, workspace: &Workspace) -> Result<()> {
    run_maintenance(ctx).await;

    let playbook = find_playbook(ctx).await?;

    let vars_path = workspace.path().join(EXTRA_VARS_FILE);
    let vars = serde_json::to_vec_pretty(&deploy.playbook_vars())?;
    tokio::fs::write(&vars_path, vars).await?;
    ctx.log
        .line(format!(
            "deploying {} service(s) with playbook {}",
            deploy.mappings.len(),
            playbook.display()
        ))
        .await;

    let settings = &ctx.config.deploy;
    let mut command = ctx
        .step(&ctx.config.tools.ansible_playbook)
        .arg(playbook.to_string_lossy())
        .args(["-i", settings.inventory.as_str()])
        .args(["--connection", settings.connection.as_str()]);
    if let Some(ref key) = settings.private_key {
        command = command.arg("--private-key").arg(key.to_string_lossy());
    }
    if let Some(ref user) = settings.remote_user {
        command = command.args(["--user", user.as_str()]);
    }
    command = command
        .arg("--extra-vars")
        .arg(format!("@{}", vars_path.display()));
    if let Some(ref user) = deploy.user {
        command = command.env("DEPLOY_USER_SUB", user.as_str());
    }

    let outcome = ctx.log.run(&command).await;
    if !outcome.success() {
        return Err(DockhandError::StepFailed {
            step: "playbook",
            outcome,
        });
    }
    ctx.log.line("deploy complete").await;
    Ok(())
}

/// Optional pre-deploy cleanup. Failure only warns.
async fn run_maintenance(ctx: &StepContext<'_>) {
    let Some((program, args)) = ctx
        .config
        .deploy
        .maintenance_command
        .as_ref()
        .and_then(|argv| argv.split_first())
    else {
        return;
    };
    ctx.log.line("running maintenance step").await;
    let command = ctx.helper(program).args(args.iter().map(String::as_str));
    let outcome = ctx.log.run(&command).await;
    if !outcome.success() {
        tracing::warn!(program = %program, outcome = %outcome, "Maintenance step failed");
        ctx.log
            .line(format!("warning: maintenance step failed ({outcome}); continuing"))
            .await;
    }
}

async fn find_playbook(ctx: &StepContext<'_>) -> Result<PathBuf> {
    let candidates = ctx.config.deploy.playbook_candidates();
    for candidate in &candidates {
        if matches!(tokio::fs::metadata(candidate).await, Ok(meta) if meta.is_file()) {
            return Ok(candidate.clone());
        }
    }
    let searched: Vec<String> = candidates
        .iter()
        .map(|c| c.display().to_string())
        .collect();
    Err(DockhandError::Precondition(format!(
        "no playbook found (searched {})",
        searched.join(", ")
    )))
}

/// Simulated deploy: the same step sequence as [`run`], no processes.
pub(crate) async fn dry_run(ctx: &StepContext<'_>, deploy: &DeploySpec, workspace: &Workspace) {
    let mut lines = vec![format!(
        "[dry_run] create workspace: {}",
        workspace.path().display()
    )];
    if ctx.config.deploy.maintenance_command.is_some() {
        lines.push("[dry_run] running maintenance step".to_string());
    }
    for (service, reference) in &deploy.mappings {
        lines.push(format!("[dry_run] {service} -> {reference}"));
    }
    lines.push(format!(
        "[dry_run] running playbook (inventory: {}, connection: {})",
        ctx.config.deploy.inventory, ctx.config.deploy.connection
    ));

    for line in lines {
        ctx.log.line(line).await;
        ctx.dry_run_pause().await;
    }
    ctx.log.line(DRY_RUN_DEPLOY_COMPLETE).await;
}
