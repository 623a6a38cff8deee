use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::runner::Secret;
use crate::store::JobMetadata;

const DEFAULT_BRANCH: &str = "main";
const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// Immutable description of one job's work.
///
/// Serialized with a `kind` tag (`build` or `deploy`); this is also the
/// payload format of the external work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TaskSpec {
    Build(BuildSpec),
    Deploy(DeploySpec),
}

impl TaskSpec {
    pub fn id(&self) -> &str {
        match self {
            TaskSpec::Build(b) => &b.id,
            TaskSpec::Deploy(d) => &d.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskSpec::Build(_) => "build",
            TaskSpec::Deploy(_) => "deploy",
        }
    }

    pub fn dry_run(&self) -> bool {
        match self {
            TaskSpec::Build(b) => b.dry_run,
            TaskSpec::Deploy(d) => d.dry_run,
        }
    }

    /// Assign `id` unless the caller already chose one.
    pub fn with_id_if_missing(mut self, id: impl FnOnce() -> String) -> Self {
        let slot = match &mut self {
            TaskSpec::Build(b) => &mut b.id,
            TaskSpec::Deploy(d) => &mut d.id,
        };
        if slot.trim().is_empty() {
            *slot = id();
        }
        self
    }

    /// Fill derived defaults (currently the build tag). Idempotent.
    pub fn with_defaults(self) -> Self {
        match self {
            TaskSpec::Build(b) => TaskSpec::Build(b.with_defaults()),
            other => other,
        }
    }
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

fn default_push() -> bool {
    true
}

/// Parameters of an image build.
#[derive(Clone, Serialize, Deserialize)]
pub struct BuildSpec {
    #[serde(default)]
    pub id: String,
    pub repo_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Image tag; a missing or empty tag is replaced by [`default_tag`].
    #[serde(default)]
    pub tag: Option<String>,
    /// Image repository, e.g. `europe-docker.pkg.dev/project/repo/app`.
    pub registry: String,
    /// Build descriptor relative to the checkout root.
    #[serde(default)]
    pub dockerfile_path: Option<String>,
    #[serde(default)]
    pub registry_username: Option<String>,
    #[serde(default)]
    pub registry_password: Option<Secret>,
    #[serde(default)]
    pub repo_username: Option<String>,
    #[serde(default)]
    pub repo_password: Option<Secret>,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    #[serde(default = "default_push")]
    pub push: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub no_cache: bool,
    /// Secret-store resource or `file://` reference holding registry
    /// credentials.
    #[serde(default)]
    pub secret_ref: Option<String>,
}

impl std::fmt::Debug for BuildSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildSpec")
            .field("id", &self.id)
            .field("branch", &self.branch)
            .field("tag", &self.tag)
            .field("registry", &self.registry)
            .field("push", &self.push)
            .field("dry_run", &self.dry_run)
            .field("no_cache", &self.no_cache)
            .finish_non_exhaustive()
    }
}

impl BuildSpec {
    pub fn new(repo_url: impl Into<String>, registry: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            repo_url: repo_url.into(),
            branch: default_branch(),
            tag: None,
            registry: registry.into(),
            dockerfile_path: None,
            registry_username: None,
            registry_password: None,
            repo_username: None,
            repo_password: None,
            build_args: BTreeMap::new(),
            push: true,
            dry_run: false,
            no_cache: false,
            secret_ref: None,
        }
    }

    pub fn with_defaults(mut self) -> Self {
        let missing = self.tag.as_deref().map(str::trim).unwrap_or("").is_empty();
        if missing {
            self.tag = Some(default_tag());
        }
        if self.branch.trim().is_empty() {
            self.branch = default_branch();
        }
        self
    }

    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or("")
    }

    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.registry, self.tag())
    }

    pub fn dockerfile(&self) -> &str {
        match self.dockerfile_path.as_deref().map(str::trim) {
            Some(path) if !path.is_empty() => path,
            _ => DEFAULT_DOCKERFILE,
        }
    }

    /// Host part of the registry, the target of `docker login`.
    pub fn registry_host(&self) -> &str {
        registry_host(&self.registry)
    }

    /// Explicit registry credentials, when both halves are present.
    pub fn registry_credentials(&self) -> Option<(&str, &Secret)> {
        match (&self.registry_username, &self.registry_password) {
            (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
                Some((user.as_str(), password))
            }
            _ => None,
        }
    }

    /// Clone location with repository credentials embedded, if any were
    /// supplied and the location is an http(s) URL.
    pub fn authenticated_repo_url(&self) -> Option<CredentialUrl> {
        match (&self.repo_username, &self.repo_password) {
            (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
                credential_url(&self.repo_url, user, password.expose())
            }
            _ => None,
        }
    }
}

/// Text before the first `/` of a registry reference.
pub fn registry_host(registry: &str) -> &str {
    registry.split('/').next().unwrap_or(registry)
}

/// An http(s) URL carrying credentials, plus the password exactly as it
/// appears inside the URL (percent-encoded).
#[derive(Debug, Clone)]
pub struct CredentialUrl {
    pub url: Secret,
    pub encoded_password: Secret,
}

impl CredentialUrl {
    /// Values to mask in the output of any command given this URL.
    pub fn secrets(&self) -> [Secret; 2] {
        [self.encoded_password.clone(), self.url.clone()]
    }
}

/// Embed percent-encoded credentials in an http(s) URL.
pub fn credential_url(location: &str, username: &str, password: &str) -> Option<CredentialUrl> {
    let mut url = Url::parse(location).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_username(username).ok()?;
    url.set_password(Some(password)).ok()?;
    let encoded_password = Secret::new(url.password()?);
    Some(CredentialUrl {
        url: Secret::new(String::from(url)),
        encoded_password,
    })
}

/// Timestamp tag `YYYYMMDD-HHMMSS` in UTC.
pub fn default_tag() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Parameters of a deployment run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploySpec {
    #[serde(default)]
    pub id: String,
    /// Logical service name to image reference (`registry/repo:tag`).
    pub mappings: BTreeMap<String, String>,
    /// Requesting user, exported to the playbook as `DEPLOY_USER_SUB`.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

const META_MAPPINGS: &str = "mappings";
const META_USER: &str = "user";
const META_DRY_RUN: &str = "dry_run";

impl DeploySpec {
    pub fn new(mappings: BTreeMap<String, String>) -> Self {
        Self {
            mappings,
            ..Default::default()
        }
    }

    /// Inputs persisted so the job can be resubmitted later.
    pub fn to_metadata(&self) -> crate::error::Result<JobMetadata> {
        let mut metadata = JobMetadata::new();
        metadata.insert(
            META_MAPPINGS.to_string(),
            serde_json::to_string(&self.mappings)?,
        );
        if let Some(ref user) = self.user {
            metadata.insert(META_USER.to_string(), user.clone());
        }
        if self.dry_run {
            metadata.insert(META_DRY_RUN.to_string(), "true".to_string());
        }
        Ok(metadata)
    }

    /// Rebuild a deploy task from persisted metadata. The error is a
    /// human-readable skip reason.
    pub fn from_metadata(id: &str, metadata: &JobMetadata) -> Result<Self, String> {
        let raw = match metadata.get(META_MAPPINGS) {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Err("no mappings field".to_string()),
        };
        let mappings: BTreeMap<String, String> =
            serde_json::from_str(raw).map_err(|e| format!("invalid mappings JSON: {e}"))?;
        Ok(Self {
            id: id.to_string(),
            mappings,
            user: metadata.get(META_USER).cloned(),
            dry_run: metadata.get(META_DRY_RUN).is_some_and(|v| v == "true"),
        })
    }

    /// Variables handed to the playbook: the full mapping plus
    /// `<service>_image` and `<service>_tag` for every service.
    pub fn playbook_vars(&self) -> serde_json::Value {
        let mut vars = serde_json::Map::new();
        vars.insert(
            META_MAPPINGS.to_string(),
            serde_json::to_value(&self.mappings).unwrap_or_default(),
        );
        for (service, reference) in &self.mappings {
            let name = normalize_service_name(service);
            let (image, tag) = split_image_ref(reference);
            vars.insert(format!("{name}_image"), image.into());
            vars.insert(format!("{name}_tag"), tag.into());
        }
        serde_json::Value::Object(vars)
    }
}

fn normalize_service_name(service: &str) -> String {
    service
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Split `registry/repo:tag` into image and tag. A colon inside the host
/// part (a port) is not a tag separator; a missing tag means `latest`.
fn split_image_ref(reference: &str) -> (&str, &str) {
    let last_slash = reference.rfind('/').map_or(0, |i| i + 1);
    match reference[last_slash..].rfind(':') {
        Some(i) => {
            let split = last_slash + i;
            (&reference[..split], &reference[split + 1..])
        }
        None => (reference, "latest"),
    }
}
