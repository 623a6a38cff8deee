//! Registry authentication before a push.
//!
//! Strategies, in order:
//! 1. explicit credentials from the build request
//! 2. a short-lived token from the identity helper (Google registries)
//! 3. a token or service-account key from a secret reference
//! 4. give up with a warning; the push is still attempted
//!
//! Passwords always travel through `docker login --password-stdin`.

use crate::runner::{self, Secret};
use crate::task::spec::BuildSpec;
use crate::task::StepContext;

const GOOGLE_REGISTRY_MARKERS: [&str; 3] = ["gcr.io", "pkg.dev", "artifactregistry"];
const TOKEN_USERNAME: &str = "oauth2accesstoken";
const KEY_FILE_USERNAME: &str = "_json_key";
const LOGIN_SUCCEEDED: &str = "Login Succeeded";

pub(crate) fn is_google_registry(registry: &str) -> bool {
    let lower = registry.to_ascii_lowercase();
    GOOGLE_REGISTRY_MARKERS.iter().any(|m| lower.contains(m))
}

/// Log into the build's registry. Returns whether a login succeeded.
pub(crate) async fn login(ctx: &StepContext<'_>, build: &BuildSpec) -> bool {
    let host = build.registry_host();
    let google = is_google_registry(&build.registry);

    if let Some((username, password)) = build.registry_credentials() {
        ctx.log
            .line(format!("logging into {host} with provided credentials"))
            .await;
        if docker_login(ctx, host, username, password).await {
            return true;
        }
        ctx.log
            .line(format!("warning: docker login to {host} failed"))
            .await;
    } else if !google {
        ctx.log
            .line(format!(
                "warning: no registry credentials provided for {host}; registry may require auth"
            ))
            .await;
        return false;
    }

    if google {
        if login_with_identity_helper(ctx, host).await {
            return true;
        }
        if login_with_secret_ref(ctx, build, host).await {
            return true;
        }
    }

    ctx.log
        .line(format!("warning: could not authenticate to {host}"))
        .await;
    false
}

async fn login_with_identity_helper(ctx: &StepContext<'_>, host: &str) -> bool {
    ctx.log
        .line(format!("attempting identity-helper login for {host}"))
        .await;
    let helper = ctx
        .helper(&ctx.config.tools.gcloud)
        .args(["auth", "print-access-token"]);
    let Some(token) = runner::capture_stdout(&helper).await else {
        ctx.log
            .line("warning: identity helper returned no token")
            .await;
        return false;
    };
    if docker_login(ctx, host, TOKEN_USERNAME, &Secret::new(token)).await {
        return true;
    }
    ctx.log
        .line(format!("warning: identity-helper login to {host} failed"))
        .await;
    false
}

async fn login_with_secret_ref(ctx: &StepContext<'_>, build: &BuildSpec, host: &str) -> bool {
    let reference = build
        .secret_ref
        .as_deref()
        .filter(|r| !r.is_empty())
        .or(ctx.config.default_secret_ref.as_deref());
    let Some(reference) = reference else {
        ctx.log
            .line("hint: set GCP_SA_KEY_PATH or provide secret_ref to enable service account login")
            .await;
        return false;
    };

    ctx.log
        .line(format!(
            "attempting to retrieve registry credential from {reference}"
        ))
        .await;
    let Some(payload) = resolve_secret_ref(ctx, reference).await else {
        ctx.log
            .line(format!("warning: failed to retrieve secret from {reference}"))
            .await;
        return false;
    };
    let Some((username, password)) = credential_from_payload(&payload) else {
        ctx.log.line("warning: secret returned empty token").await;
        return false;
    };
    if docker_login(ctx, host, username, &password).await {
        return true;
    }
    ctx.log
        .line(format!(
            "warning: docker login with secret credential to {host} failed"
        ))
        .await;
    false
}

/// Username and password for a secret payload. A JSON object is a
/// service-account key; anything else non-empty is a raw access token.
pub(crate) fn credential_from_payload(payload: &Secret) -> Option<(&'static str, Secret)> {
    let trimmed = payload.expose().trim();
    if trimmed.is_empty() {
        return None;
    }
    let is_key_file = serde_json::from_str::<serde_json::Value>(trimmed)
        .map(|v| v.is_object())
        .unwrap_or(false);
    let username = if is_key_file {
        KEY_FILE_USERNAME
    } else {
        TOKEN_USERNAME
    };
    Some((username, Secret::new(trimmed)))
}

/// `projects/P/secrets/N/versions/V` split into project, name and version.
pub(crate) fn parse_secret_resource(reference: &str) -> Option<(&str, &str, &str)> {
    let parts: Vec<&str> = reference.trim_matches('/').split('/').collect();
    match parts.as_slice() {
        ["projects", project, "secrets", name, "versions", version]
            if !project.is_empty() && !name.is_empty() && !version.is_empty() =>
        {
            Some((project, name, version))
        }
        _ => None,
    }
}

async fn resolve_secret_ref(ctx: &StepContext<'_>, reference: &str) -> Option<Secret> {
    if let Some(path) = reference.strip_prefix("file://") {
        return match tokio::fs::read_to_string(path).await {
            Ok(contents) => Some(Secret::new(contents)),
            Err(e) => {
                tracing::warn!(path, error = %e, "Failed to read secret file");
                None
            }
        };
    }

    let Some((project, name, version)) = parse_secret_resource(reference) else {
        tracing::warn!(reference, "Unsupported secret reference");
        return None;
    };
    let helper = ctx.helper(&ctx.config.tools.gcloud).args([
        "secrets",
        "versions",
        "access",
        version,
        "--secret",
        name,
        "--project",
        project,
    ]);
    runner::capture_stdout(&helper).await.map(Secret::new)
}

async fn docker_login(
    ctx: &StepContext<'_>,
    host: &str,
    username: &str,
    password: &Secret,
) -> bool {
    let spec = ctx
        .helper(&ctx.config.tools.docker)
        .args(["login", host, "--username", username, "--password-stdin"])
        .stdin(password.clone());
    let mut confirmed = false;
    let outcome = ctx
        .log
        .run_inspecting(&spec, |line| {
            if line.contains(LOGIN_SUCCEEDED) {
                confirmed = true;
            }
        })
        .await;
    outcome.success() && confirmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn google_registries_are_detected() {
        assert!(is_google_registry("eu.gcr.io/project/app"));
        assert!(is_google_registry("europe-west1-docker.pkg.dev/p/r/app"));
        assert!(is_google_registry("ArtifactRegistry.example/app"));
        assert!(!is_google_registry("ghcr.io/org/app"));
        assert!(!is_google_registry("registry.example.com/app"));
    }

    #[test]
    fn json_payload_is_a_key_file() {
        let (user, password) =
            credential_from_payload(&Secret::new("{\"type\":\"service_account\"}\n")).unwrap();
        assert_eq!(user, "_json_key");
        assert_eq!(password.expose(), "{\"type\":\"service_account\"}");
    }

    #[test]
    fn other_payload_is_a_token() {
        let (user, password) = credential_from_payload(&Secret::new(" ya29.token \n")).unwrap();
        assert_eq!(user, "oauth2accesstoken");
        assert_eq!(password.expose(), "ya29.token");
        assert!(credential_from_payload(&Secret::new("  \n")).is_none());
    }

    #[test]
    fn secret_resource_parsing() {
        assert_eq!(
            parse_secret_resource("projects/acme/secrets/registry/versions/latest"),
            Some(("acme", "registry", "latest"))
        );
        assert!(parse_secret_resource("projects/acme/secrets/registry").is_none());
        assert!(parse_secret_resource("file:///tmp/key.json").is_none());
    }
}
