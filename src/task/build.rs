use std::path::Path;

use crate::error::{DockhandError, Result};
use crate::task::spec::BuildSpec;
use crate::task::{auth, StepContext};
use crate::workspace::Workspace;

/// Final line of a simulated build.
pub const DRY_RUN_BUILD_COMPLETE: &str = "[dry_run] build complete";

/// Clone, build and optionally push one image.
///
/// Steps: checkout, descriptor check, image build, then login and push when
/// requested. Login is best effort; every other step is required.
pub(crate) async fn run(ctx: &StepContext<'_>, build: &BuildSpec, workspace: &Workspace) -> Result<()> {
    let tools = &ctx.config.tools;
    let checkout = workspace.path();

    let mut clone = ctx.step(&tools.git).args(["clone", "--depth", "1", "--branch"]);
    clone = clone.arg(build.branch.as_str());
    match build.authenticated_repo_url() {
        Some(creds) => {
            ctx.log
                .line("cloning private repository (authenticated)")
                .await;
            if let Some(ref password) = build.repo_password {
                clone = clone.redact(password.clone());
            }
            clone = clone.arg(creds.url.expose());
            for secret in creds.secrets() {
                clone = clone.redact(secret);
            }
        }
        None => {
            ctx.log
                .line(format!("cloning repository {}", build.repo_url))
                .await;
            clone = clone.arg(build.repo_url.as_str());
        }
    }
    clone = clone.arg(checkout.to_string_lossy());
    let outcome = ctx.log.run(&clone).await;
    if !outcome.success() {
        return Err(DockhandError::StepFailed {
            step: "clone",
            outcome,
        });
    }

    let dockerfile = workspace.resolve(build.dockerfile())?;
    if !descriptor_exists(&dockerfile).await {
        return Err(DockhandError::Precondition(format!(
            "build descriptor not found at {}",
            dockerfile.display()
        )));
    }

    let image_ref = build.image_ref();
    let no_cache = if build.no_cache { " --no-cache" } else { "" };
    ctx.log
        .line(format!("building image {image_ref}{no_cache}"))
        .await;
    let mut docker_build = ctx.step(&tools.docker).arg("build");
    if build.no_cache {
        docker_build = docker_build.arg("--no-cache");
    }
    docker_build = docker_build
        .args(["-t", image_ref.as_str(), "-f"])
        .arg(dockerfile.to_string_lossy());
    for (key, value) in &build.build_args {
        docker_build = docker_build.arg("--build-arg").arg(format!("{key}={value}"));
    }
    docker_build = docker_build.arg(checkout.to_string_lossy());
    let outcome = ctx.log.run(&docker_build).await;
    if !outcome.success() {
        return Err(DockhandError::StepFailed {
            step: "build",
            outcome,
        });
    }

    if build.push {
        if !auth::login(ctx, build).await {
            ctx.log
                .line(format!(
                    "warning: pushing to {} without successful login (may fail)",
                    build.registry
                ))
                .await;
        }
        ctx.log.line(format!("pushing image {image_ref}")).await;
        let push = ctx.step(&tools.docker).args(["push", image_ref.as_str()]);
        let outcome = ctx.log.run(&push).await;
        if !outcome.success() {
            return Err(DockhandError::StepFailed {
                step: "push",
                outcome,
            });
        }
    }

    ctx.log.line("build complete").await;
    Ok(())
}

async fn descriptor_exists(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.is_file())
}

/// Simulated build: the same step sequence as [`run`], no processes.
pub(crate) async fn dry_run(ctx: &StepContext<'_>, build: &BuildSpec, workspace: &Workspace) {
    let image_ref = build.image_ref();
    let no_cache = if build.no_cache { " --no-cache" } else { "" };

    let mut lines = vec![
        format!("[dry_run] create workspace: {}", workspace.path().display()),
        format!(
            "[dry_run] cloning {} (branch: {})",
            build.repo_url, build.branch
        ),
        "[dry_run] checking dockerfile".to_string(),
        format!("[dry_run] building image {image_ref}{no_cache}"),
    ];
    if build.push {
        lines.push(format!(
            "[dry_run] logging into {} (if credentials provided)",
            build.registry
        ));
        lines.push(format!("[dry_run] pushing image {image_ref}"));
    }

    for line in lines {
        ctx.log.line(line).await;
        ctx.dry_run_pause().await;
    }
    ctx.log.line(DRY_RUN_BUILD_COMPLETE).await;
}
