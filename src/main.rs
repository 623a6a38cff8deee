use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::de::DeserializeOwned;
use tracing_subscriber::EnvFilter;

use dockhand::api::SubmitJobResponse;
use dockhand::config::{DeployConfig, ServiceConfig, TimeoutConfig, ToolsConfig};
use dockhand::queue::{ResubmitOutcome, ResubmitReport};
use dockhand::runner::Secret;
use dockhand::service::Service;
use dockhand::shutdown::install_shutdown_handler;
use dockhand::store::Job;
use dockhand::task::{BuildSpec, DeploySpec, TaskSpec};

#[derive(Parser, Debug)]
#[command(name = "dockhand")]
#[command(version)]
#[command(about = "Asynchronous build and deploy job service")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the HTTP API (and the queue consumer when Redis is configured)
    Serve(ServerArgs),

    /// Run only the queue consumer
    Worker(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address for the HTTP API
    #[arg(long, env = "DOCKHAND_LISTEN", default_value = "0.0.0.0:8998")]
    listen: SocketAddr,

    /// Redis connection string for the job store and work queue
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Maximum number of tasks running at once
    #[arg(long, env = "DOCKHAND_MAX_TASKS", default_value = "4")]
    max_tasks: usize,

    #[arg(long, env = "DOCKHAND_GIT", default_value = "git")]
    git: String,

    #[arg(long, env = "DOCKHAND_DOCKER", default_value = "docker")]
    docker: String,

    #[arg(long, env = "DOCKHAND_GCLOUD", default_value = "gcloud")]
    gcloud: String,

    #[arg(long, env = "DOCKHAND_ANSIBLE_PLAYBOOK", default_value = "ansible-playbook")]
    ansible_playbook: String,

    /// Bound on auxiliary calls such as token helpers, in seconds
    #[arg(long, env = "DOCKHAND_HELPER_TIMEOUT_SECS", default_value = "20")]
    helper_timeout_secs: u64,

    /// Bound on required steps (clone, build, push, playbook), in seconds
    #[arg(long, env = "DOCKHAND_STEP_TIMEOUT_SECS")]
    step_timeout_secs: Option<u64>,

    /// Service-account key used when a build names no secret reference
    #[arg(long, env = "GCP_SA_KEY_PATH")]
    gcp_sa_key_path: Option<PathBuf>,

    /// Playbook path (default: deploy/playbook.yml, then playbook.yml)
    #[arg(long, env = "DOCKHAND_PLAYBOOK")]
    playbook: Option<PathBuf>,

    #[arg(long, env = "DOCKHAND_INVENTORY", default_value = "localhost,")]
    inventory: String,

    #[arg(long, env = "DOCKHAND_CONNECTION", default_value = "local")]
    connection: String,

    #[arg(long, env = "DOCKHAND_PRIVATE_KEY")]
    private_key: Option<PathBuf>,

    #[arg(long, env = "DOCKHAND_REMOTE_USER")]
    remote_user: Option<String>,

    /// Best-effort command run before every deploy (whitespace separated)
    #[arg(long, env = "DOCKHAND_MAINTENANCE_CMD")]
    maintenance_cmd: Option<String>,
}

impl ServerArgs {
    fn into_config(self) -> ServiceConfig {
        let mut config = ServiceConfig::new(self.listen)
            .with_max_concurrent_tasks(self.max_tasks)
            .with_tools(ToolsConfig {
                git: self.git,
                docker: self.docker,
                gcloud: self.gcloud,
                ansible_playbook: self.ansible_playbook,
            })
            .with_deploy(DeployConfig {
                playbook: self.playbook,
                inventory: self.inventory,
                connection: self.connection,
                private_key: self.private_key,
                remote_user: self.remote_user,
                maintenance_command: self
                    .maintenance_cmd
                    .map(|cmd| cmd.split_whitespace().map(str::to_string).collect::<Vec<_>>())
                    .filter(|argv| !argv.is_empty()),
            })
            .with_timeouts(TimeoutConfig {
                helper: Duration::from_secs(self.helper_timeout_secs),
                step: self.step_timeout_secs.map(Duration::from_secs),
                ..TimeoutConfig::default()
            });
        if let Some(url) = self.redis_url.filter(|u| !u.is_empty()) {
            config = config.with_redis_url(url);
        }
        config.default_secret_ref = self
            .gcp_sa_key_path
            .map(|path| format!("file://{}", path.display()));
        config
    }
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', env = "DOCKHAND_ADDR", default_value = "http://127.0.0.1:8998")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit an image build
    Build {
        /// Source repository URL
        repo_url: String,
        /// Image repository, e.g. europe-docker.pkg.dev/project/repo/app
        registry: String,
        #[arg(long, default_value = "main")]
        branch: String,
        /// Image tag (default: UTC timestamp)
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        dockerfile: Option<String>,
        /// Build argument, KEY=VALUE (repeatable)
        #[arg(long = "build-arg", value_parser = parse_key_value)]
        build_args: Vec<(String, String)>,
        #[arg(long)]
        registry_username: Option<String>,
        #[arg(long, env = "DOCKHAND_REGISTRY_PASSWORD", hide_env_values = true)]
        registry_password: Option<String>,
        #[arg(long)]
        repo_username: Option<String>,
        #[arg(long, env = "DOCKHAND_REPO_PASSWORD", hide_env_values = true)]
        repo_password: Option<String>,
        #[arg(long)]
        secret_ref: Option<String>,
        #[arg(long)]
        no_push: bool,
        #[arg(long)]
        no_cache: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Submit a deployment
    Deploy {
        /// Service mapping, SERVICE=IMAGE:TAG (repeatable)
        #[arg(long = "map", value_parser = parse_key_value, required = true)]
        mappings: Vec<(String, String)>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Get status and logs of a job
    Status { job_id: String },
    /// List all jobs
    List,
    /// Re-run a deploy job from its stored inputs
    Resubmit {
        /// Job to resubmit
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        job_id: Option<String>,
        /// Resubmit every known job
        #[arg(long)]
        all: bool,
        /// Also resubmit jobs that already finished successfully
        #[arg(long)]
        force: bool,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))
}

// =============================================================================
// Server Implementation
// =============================================================================

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn run_server(args: ServerArgs, worker_only: bool) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = args.into_config();
    tracing::info!(
        listen_addr = %config.listen_addr,
        max_tasks = config.max_concurrent_tasks,
        redis = config.store.redis_url.is_some(),
        worker_only,
        "Starting dockhand"
    );

    let shutdown = install_shutdown_handler()?;
    let service = Service::start(config).await;
    if worker_only {
        service.run_worker(shutdown).await?;
    } else {
        service.serve(shutdown).await?;
    }
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    fn new(addr: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: addr.trim_end_matches('/').to_string(),
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, Box<dyn std::error::Error>> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("server returned {status}: {body}").into());
        }
        Ok(response.json().await?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Box<dyn std::error::Error>> {
        self.send(self.http.get(format!("{}{path}", self.base))).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&TaskSpec>,
    ) -> Result<T, Box<dyn std::error::Error>> {
        let mut request = self.http.post(format!("{}{path}", self.base));
        if let Some(body) = body {
            request = request.json(body);
        }
        self.send(request).await
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn handle_submit(
    client: &ApiClient,
    spec: TaskSpec,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response: SubmitJobResponse = client.post("/jobs", Some(&spec)).await?;
    match output_format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", response.id);
        }
    }
    Ok(())
}

async fn handle_job_status(
    client: &ApiClient,
    job_id: &str,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let job: Job = client.get(&format!("/jobs/{job_id}")).await?;
    match output_format {
        OutputFormat::Json => print_json(&job)?,
        OutputFormat::Table => {
            println!("Job ID:   {}", job.id);
            println!("State:    {}", job.state);
            println!("Created:  {}", job.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
            if !job.logs.is_empty() {
                println!("Logs:");
                for line in &job.logs {
                    println!("  {line}");
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_list(
    client: &ApiClient,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs: Vec<Job> = client.get("/jobs").await?;
    match output_format {
        OutputFormat::Json => print_json(&jobs)?,
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!("{:<38} {:<10} {:<20} LAST LINE", "JOB ID", "STATE", "CREATED");
            println!("{}", "-".repeat(90));
            for job in &jobs {
                let last = job.logs.last().map(String::as_str).unwrap_or("");
                let last = if last.chars().count() > 30 {
                    format!("{}...", last.chars().take(27).collect::<String>())
                } else {
                    last.to_string()
                };
                println!(
                    "{:<38} {:<10} {:<20} {}",
                    job.id,
                    job.state,
                    job.created_at.format("%Y-%m-%d %H:%M:%S"),
                    last
                );
            }
            println!();
            println!("{} jobs", jobs.len());
        }
    }
    Ok(())
}

async fn handle_resubmit(
    client: &ApiClient,
    job_id: Option<String>,
    force: bool,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match job_id {
        Some(id) => {
            let outcome: ResubmitOutcome = client
                .post(&format!("/jobs/{id}/resubmit?force={force}"), None)
                .await?;
            match output_format {
                OutputFormat::Json => print_json(&outcome)?,
                OutputFormat::Table if outcome.ok => println!("Job {} re-enqueued", outcome.id),
                OutputFormat::Table => println!(
                    "Job {} skipped: {}",
                    outcome.id,
                    outcome.reason.as_deref().unwrap_or("unknown reason")
                ),
            }
        }
        None => {
            let report: ResubmitReport = client
                .post(&format!("/jobs/resubmit?force={force}"), None)
                .await?;
            match output_format {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Table => {
                    for id in &report.requeued {
                        println!("{id}: re-enqueued");
                    }
                    for skipped in &report.skipped {
                        println!("{}: skipped ({})", skipped.id, skipped.reason);
                    }
                    for failed in &report.errors {
                        println!("{}: error ({})", failed.id, failed.error);
                    }
                    println!();
                    println!(
                        "Requeued: {}. Skipped: {}. Errors: {}.",
                        report.requeued.len(),
                        report.skipped.len(),
                        report.errors.len()
                    );
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(server_args) => run_server(server_args, false).await?,
        Commands::Worker(server_args) => run_server(server_args, true).await?,
        Commands::Job { client, command } => {
            let api = ApiClient::new(&client.addr);
            match command {
                JobCommands::Build {
                    repo_url,
                    registry,
                    branch,
                    tag,
                    dockerfile,
                    build_args,
                    registry_username,
                    registry_password,
                    repo_username,
                    repo_password,
                    secret_ref,
                    no_push,
                    no_cache,
                    dry_run,
                } => {
                    let mut build = BuildSpec::new(repo_url, registry);
                    build.branch = branch;
                    build.tag = tag;
                    build.dockerfile_path = dockerfile;
                    build.build_args = build_args.into_iter().collect();
                    build.registry_username = registry_username;
                    build.registry_password = registry_password.map(Secret::from);
                    build.repo_username = repo_username;
                    build.repo_password = repo_password.map(Secret::from);
                    build.secret_ref = secret_ref;
                    build.push = !no_push;
                    build.no_cache = no_cache;
                    build.dry_run = dry_run;
                    handle_submit(&api, TaskSpec::Build(build), &client.output).await?;
                }
                JobCommands::Deploy {
                    mappings,
                    user,
                    dry_run,
                } => {
                    let mut deploy = DeploySpec::new(mappings.into_iter().collect::<BTreeMap<_, _>>());
                    deploy.user = user;
                    deploy.dry_run = dry_run;
                    handle_submit(&api, TaskSpec::Deploy(deploy), &client.output).await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&api, &job_id, &client.output).await?;
                }
                JobCommands::List => {
                    handle_job_list(&api, &client.output).await?;
                }
                JobCommands::Resubmit { job_id, all, force } => {
                    let target = if all { None } else { job_id };
                    handle_resubmit(&api, target, force, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}
