use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Executables for the external toolchain.
///
/// Each entry is either a bare program name resolved through `PATH` or an
/// absolute path. Tests point these at harmless stand-ins (`true`, `sh`).
#[derive(Debug, Clone)]
pub struct ToolsConfig {
    pub git: String,
    pub docker: String,
    pub gcloud: String,
    pub ansible_playbook: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            git: "git".to_string(),
            docker: "docker".to_string(),
            gcloud: "gcloud".to_string(),
            ansible_playbook: "ansible-playbook".to_string(),
        }
    }
}

/// Parameters for the configuration-management invocation of deploy tasks.
#[derive(Debug, Clone)]
pub struct DeployConfig {
    /// Explicit playbook path. When unset the default search list is used.
    pub playbook: Option<PathBuf>,
    /// Inventory passed with `-i` (host targeting).
    pub inventory: String,
    /// Connection plugin passed with `--connection`.
    pub connection: String,
    /// Private key file for remote connections.
    pub private_key: Option<PathBuf>,
    /// Remote user for remote connections.
    pub remote_user: Option<String>,
    /// Best-effort maintenance command run before the playbook (argv).
    pub maintenance_command: Option<Vec<String>>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            playbook: None,
            inventory: "localhost,".to_string(),
            connection: "local".to_string(),
            private_key: None,
            remote_user: None,
            maintenance_command: None,
        }
    }
}

impl DeployConfig {
    /// Candidate playbook locations, in search order.
    pub fn playbook_candidates(&self) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(ref path) = self.playbook {
            candidates.push(path.clone());
        }
        candidates.push(PathBuf::from("deploy/playbook.yml"));
        candidates.push(PathBuf::from("playbook.yml"));
        candidates
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Bound on auxiliary calls (identity token, secret lookups).
    pub helper: Duration,
    /// Optional bound on required steps (clone, build, push, playbook).
    pub step: Option<Duration>,
    /// Pause between simulated steps in dry-run mode.
    pub dry_run_step_delay: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            helper: Duration::from_secs(20),
            step: None,
            dry_run_step_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Connection string for the remote store and work queue. `None` selects
    /// the in-memory store and in-process execution.
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen_addr: SocketAddr,
    pub max_concurrent_tasks: usize,
    /// Secret reference applied to builds that do not name one.
    pub default_secret_ref: Option<String>,
    pub store: StoreConfig,
    pub tools: ToolsConfig,
    pub deploy: DeployConfig,
    pub timeouts: TimeoutConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8998)),
            max_concurrent_tasks: 4,
            default_secret_ref: None,
            store: StoreConfig::default(),
            tools: ToolsConfig::default(),
            deploy: DeployConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_max_concurrent_tasks(mut self, slots: usize) -> Self {
        self.max_concurrent_tasks = slots.max(1);
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.store.redis_url = Some(url.into());
        self
    }

    pub fn with_tools(mut self, tools: ToolsConfig) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_deploy(mut self, deploy: DeployConfig) -> Self {
        self.deploy = deploy;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tools_config_default() {
        let cfg = ToolsConfig::default();
        assert_eq!(cfg.git, "git");
        assert_eq!(cfg.docker, "docker");
        assert_eq!(cfg.gcloud, "gcloud");
        assert_eq!(cfg.ansible_playbook, "ansible-playbook");
    }

    #[test]
    fn deploy_config_default() {
        let cfg = DeployConfig::default();
        assert!(cfg.playbook.is_none());
        assert_eq!(cfg.inventory, "localhost,");
        assert_eq!(cfg.connection, "local");
        assert!(cfg.private_key.is_none());
        assert!(cfg.remote_user.is_none());
        assert!(cfg.maintenance_command.is_none());
    }

    #[test]
    fn playbook_candidates_prefer_configured_path() {
        let cfg = DeployConfig {
            playbook: Some(PathBuf::from("/srv/site.yml")),
            ..Default::default()
        };
        let candidates = cfg.playbook_candidates();
        assert_eq!(candidates[0], PathBuf::from("/srv/site.yml"));
        assert_eq!(candidates[1], PathBuf::from("deploy/playbook.yml"));
        assert_eq!(candidates[2], PathBuf::from("playbook.yml"));
    }

    #[test]
    fn timeout_config_default() {
        let cfg = TimeoutConfig::default();
        assert_eq!(cfg.helper, Duration::from_secs(20));
        assert!(cfg.step.is_none());
        assert_eq!(cfg.dry_run_step_delay, Duration::from_millis(50));
    }

    #[test]
    fn service_config_default() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:8998");
        assert_eq!(cfg.max_concurrent_tasks, 4);
        assert!(cfg.store.redis_url.is_none());
        assert!(cfg.default_secret_ref.is_none());
    }

    #[test]
    fn service_config_builders() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let cfg = ServiceConfig::new(addr)
            .with_max_concurrent_tasks(0)
            .with_redis_url("redis://localhost:6379/0");
        assert_eq!(cfg.listen_addr, addr);
        // zero slots would deadlock every task
        assert_eq!(cfg.max_concurrent_tasks, 1);
        assert_eq!(
            cfg.store.redis_url.as_deref(),
            Some("redis://localhost:6379/0")
        );
    }
}
