use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use dockhand::config::{ServiceConfig, TimeoutConfig};
use dockhand::error::{DockhandError, Result};
use dockhand::queue::{JobService, TaskQueue};
use dockhand::store::{InMemoryJobStore, Job, JobMetadata, JobState, SharedJobStore};
use dockhand::task::{BuildSpec, DeploySpec, TaskExecutor, TaskSpec};
use dockhand::worker::WorkerPool;

fn fast_config() -> ServiceConfig {
    ServiceConfig::default()
        .with_max_concurrent_tasks(2)
        .with_timeouts(TimeoutConfig {
            dry_run_step_delay: Duration::from_millis(5),
            ..TimeoutConfig::default()
        })
}

fn pool(store: &SharedJobStore) -> WorkerPool {
    WorkerPool::new(TaskExecutor::new(store.clone(), fast_config()))
}

fn local_service() -> (SharedJobStore, JobService) {
    let store: SharedJobStore = Arc::new(InMemoryJobStore::new());
    let service = JobService::local(store.clone(), pool(&store));
    (store, service)
}

fn dry_deploy() -> TaskSpec {
    let mut mappings = BTreeMap::new();
    mappings.insert("web".to_string(), "registry.example.com/web:3".to_string());
    let mut deploy = DeploySpec::new(mappings);
    deploy.dry_run = true;
    TaskSpec::Deploy(deploy)
}

fn dry_build() -> TaskSpec {
    let mut build = BuildSpec::new("https://git.example.com/org/app.git", "registry.example.com/app");
    build.dry_run = true;
    TaskSpec::Build(build)
}

async fn wait_terminal(store: &SharedJobStore, id: &str) -> Job {
    for _ in 0..1000 {
        let job = store.get(id).await.unwrap().unwrap();
        if job.state.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} did not finish in time");
}

/// Records what it receives along with the job state at enqueue time.
struct RecordingQueue {
    store: SharedJobStore,
    seen: Mutex<Vec<(String, JobState)>>,
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn enqueue(&self, spec: TaskSpec) -> Result<()> {
        let state = self.store.get(spec.id()).await?.map(|job| job.state);
        self.seen
            .lock()
            .unwrap()
            .push((spec.id().to_string(), state.expect("job exists before enqueue")));
        Ok(())
    }
}

struct BrokenQueue;

#[async_trait]
impl TaskQueue for BrokenQueue {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn enqueue(&self, _spec: TaskSpec) -> Result<()> {
        Err(DockhandError::Internal("connection refused".to_string()))
    }
}

#[tokio::test]
async fn test_submit_runs_to_done() {
    let (store, service) = local_service();
    let id = service.submit(dry_deploy()).await.unwrap();

    let job = wait_terminal(&store, &id).await;
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.logs.first().map(String::as_str), Some("running in-process"));
}

#[tokio::test]
async fn test_submit_assigns_unique_ids() {
    let (_store, service) = local_service();
    let a = service.submit(dry_deploy()).await.unwrap();
    let b = service.submit(dry_deploy()).await.unwrap();
    assert_ne!(a, b);
    assert!(uuid::Uuid::parse_str(&a).is_ok());
}

#[tokio::test]
async fn test_job_is_queued_before_enqueue() {
    let store: SharedJobStore = Arc::new(InMemoryJobStore::new());
    let queue = Arc::new(RecordingQueue {
        store: store.clone(),
        seen: Mutex::new(Vec::new()),
    });
    let service = JobService::with_queue(store.clone(), queue.clone(), pool(&store));

    let id = service.submit(dry_deploy()).await.unwrap();
    store.set_state(&id, JobState::Done).await;
    service.resubmit(&id, true).await.unwrap();

    let seen = queue.seen.lock().unwrap().clone();
    assert_eq!(seen, vec![(id.clone(), JobState::Queued), (id.clone(), JobState::Queued)]);

    let job = store.get(&id).await.unwrap().unwrap();
    assert_eq!(
        job.logs,
        vec!["enqueued to work queue", "re-enqueued", "enqueued to work queue"]
    );
}

#[tokio::test]
async fn test_resubmit_skips_done_without_force() {
    let (store, service) = local_service();
    let id = service.submit(dry_deploy()).await.unwrap();
    let before = wait_terminal(&store, &id).await;
    assert_eq!(before.state, JobState::Done);

    let outcome = service.resubmit(&id, false).await.unwrap();
    assert!(!outcome.ok);
    assert_eq!(outcome.reason.as_deref(), Some("already done"));

    let after = store.get(&id).await.unwrap().unwrap();
    assert_eq!(after.state, JobState::Done);
    assert_eq!(after.logs, before.logs);
}

#[tokio::test]
async fn test_submit_refuses_existing_id() {
    let (store, service) = local_service();
    let mut spec = dry_deploy();
    if let TaskSpec::Deploy(ref mut deploy) = spec {
        deploy.id = "fixed".to_string();
    }

    let id = service.submit(spec.clone()).await.unwrap();
    assert_eq!(id, "fixed");
    let before = wait_terminal(&store, &id).await;
    assert_eq!(before.state, JobState::Done);

    let err = service.submit(spec).await.unwrap_err();
    assert!(matches!(err, DockhandError::JobExists(ref id) if id == "fixed"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let after = store.get("fixed").await.unwrap().unwrap();
    assert_eq!(after.state, JobState::Done);
    assert_eq!(after.logs, before.logs);
}

#[tokio::test]
async fn test_resubmit_skips_in_flight_run() {
    let store: SharedJobStore = Arc::new(InMemoryJobStore::new());
    let slow = fast_config().with_timeouts(TimeoutConfig {
        dry_run_step_delay: Duration::from_millis(100),
        ..TimeoutConfig::default()
    });
    let service = JobService::local(
        store.clone(),
        WorkerPool::new(TaskExecutor::new(store.clone(), slow)),
    );
    let id = service.submit(dry_deploy()).await.unwrap();

    let mut state = JobState::Queued;
    for _ in 0..200 {
        state = store.get(&id).await.unwrap().unwrap().state;
        if state == JobState::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(state, JobState::Running);

    let outcome = service.resubmit(&id, false).await.unwrap();
    assert!(!outcome.ok);
    assert_eq!(outcome.reason.as_deref(), Some("already running"));

    let job = wait_terminal(&store, &id).await;
    assert_eq!(job.state, JobState::Done);
    assert!(!job.logs.iter().any(|l| l == "re-enqueued"));
    let count = |prefix: &str| job.logs.iter().filter(|l| l.starts_with(prefix)).count();
    assert_eq!(count("[dry_run] create workspace"), 1);
    assert_eq!(count("[dry_run] deploy complete"), 1);
}

#[tokio::test]
async fn test_resubmit_skips_queued_job() {
    let store: SharedJobStore = Arc::new(InMemoryJobStore::new());
    let queue = Arc::new(RecordingQueue {
        store: store.clone(),
        seen: Mutex::new(Vec::new()),
    });
    let service = JobService::with_queue(store.clone(), queue.clone(), pool(&store));

    // Nothing consumes the recording queue, so the job stays queued.
    let id = service.submit(dry_deploy()).await.unwrap();
    let outcome = service.resubmit(&id, false).await.unwrap();
    assert!(!outcome.ok);
    assert_eq!(outcome.reason.as_deref(), Some("already queued"));
    assert_eq!(queue.seen.lock().unwrap().len(), 1);

    let outcome = service.resubmit(&id, true).await.unwrap();
    assert!(outcome.ok);
    assert_eq!(queue.seen.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_forced_resubmit_runs_again() {
    let (store, service) = local_service();
    let id = service.submit(dry_deploy()).await.unwrap();
    let first = wait_terminal(&store, &id).await;

    let outcome = service.resubmit(&id, true).await.unwrap();
    assert!(outcome.ok);
    assert_eq!(outcome.reason, None);

    // Wait for the second run: logs grow past the first run's plus the marker.
    let mut job = store.get(&id).await.unwrap().unwrap();
    for _ in 0..1000 {
        if job.state.is_terminal() && job.logs.len() > first.logs.len() + 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        job = store.get(&id).await.unwrap().unwrap();
    }
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.logs[first.logs.len()], "re-enqueued");
    assert_eq!(
        job.logs.iter().filter(|l| l.as_str() == "[dry_run] deploy complete").count(),
        2
    );
}

#[tokio::test]
async fn test_resubmit_error_job_without_force() {
    let (store, service) = local_service();
    let id = "failed-deploy";
    store.create(id, JobState::Error, vec!["error: boom".to_string()]).await.unwrap();
    let mut metadata = JobMetadata::new();
    metadata.insert("mappings".into(), r#"{"web":"registry.example.com/web:3"}"#.into());
    metadata.insert("dry_run".into(), "true".into());
    store.set_metadata(id, &metadata).await.unwrap();

    let outcome = service.resubmit(id, false).await.unwrap();
    assert!(outcome.ok);

    let job = wait_terminal(&store, id).await;
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.logs[0], "error: boom");
    assert_eq!(job.logs[1], "re-enqueued");
}

#[tokio::test]
async fn test_build_jobs_cannot_be_resubmitted() {
    let (store, service) = local_service();
    let id = service.submit(dry_build()).await.unwrap();
    wait_terminal(&store, &id).await;

    let outcome = service.resubmit(&id, true).await.unwrap();
    assert!(!outcome.ok);
    assert_eq!(outcome.reason.as_deref(), Some("no deploy metadata"));
}

#[tokio::test]
async fn test_corrupt_metadata_is_skipped() {
    let (store, service) = local_service();
    store.create("corrupt", JobState::Error, Vec::new()).await.unwrap();
    let mut metadata = JobMetadata::new();
    metadata.insert("mappings".into(), "{not json".into());
    store.set_metadata("corrupt", &metadata).await.unwrap();

    let outcome = service.resubmit("corrupt", true).await.unwrap();
    assert!(!outcome.ok);
    assert!(outcome
        .reason
        .unwrap()
        .starts_with("invalid mappings JSON"));
    assert_eq!(
        store.get("corrupt").await.unwrap().unwrap().state,
        JobState::Error
    );
}

#[tokio::test]
async fn test_resubmit_unknown_job() {
    let (_store, service) = local_service();
    let err = service.resubmit("does-not-exist", false).await.unwrap_err();
    assert!(matches!(err, DockhandError::JobNotFound(ref id) if id == "does-not-exist"));
}

#[tokio::test]
async fn test_resubmit_all_reports_each_job() {
    let (store, service) = local_service();
    let done = service.submit(dry_deploy()).await.unwrap();
    let build = service.submit(dry_build()).await.unwrap();
    wait_terminal(&store, &done).await;
    wait_terminal(&store, &build).await;

    let failed = "failed-deploy";
    store.create(failed, JobState::Error, Vec::new()).await.unwrap();
    let mut metadata = JobMetadata::new();
    metadata.insert("mappings".into(), r#"{"api":"registry.example.com/api:1"}"#.into());
    metadata.insert("dry_run".into(), "true".into());
    store.set_metadata(failed, &metadata).await.unwrap();

    let report = service.resubmit_all(false).await.unwrap();
    assert_eq!(report.requeued, vec![failed.to_string()]);
    assert_eq!(report.skipped.len(), 2);
    assert!(report
        .skipped
        .iter()
        .any(|s| s.id == done && s.reason == "already done"));
    assert!(report
        .skipped
        .iter()
        .any(|s| s.id == build && s.reason == "no deploy metadata"));
    assert!(report.errors.is_empty());

    wait_terminal(&store, failed).await;
}

#[tokio::test]
async fn test_enqueue_failure_falls_back_to_local() {
    let store: SharedJobStore = Arc::new(InMemoryJobStore::new());
    let service = JobService::with_queue(store.clone(), Arc::new(BrokenQueue), pool(&store));
    assert_eq!(service.queue_name(), "broken");

    let id = service.submit(dry_deploy()).await.unwrap();
    let job = wait_terminal(&store, &id).await;

    assert_eq!(job.state, JobState::Done);
    assert_eq!(
        job.logs.first().map(String::as_str),
        Some("enqueue to work queue failed; running in-process")
    );
}

// Redis work queue, skipped without REDIS_URL

#[tokio::test]
async fn test_redis_queue_is_first_in_first_out() {
    use dockhand::queue::{pop_task, RedisQueue};
    use dockhand::store::RedisHandle;

    let Ok(url) = std::env::var("REDIS_URL") else {
        eprintln!("REDIS_URL not set, skipping");
        return;
    };
    let handle = RedisHandle::connect(&url, Duration::from_secs(5)).await.unwrap();
    let key = format!("dockhand:test:{}", uuid::Uuid::new_v4());
    let queue = RedisQueue::with_key(handle.manager(), key.clone());
    assert_eq!(queue.name(), "redis");

    for id in ["first", "second"] {
        let mut spec = dry_deploy();
        if let TaskSpec::Deploy(ref mut deploy) = spec {
            deploy.id = id.to_string();
        }
        queue.enqueue(spec).await.unwrap();
    }
    assert_eq!(queue.depth().await.unwrap(), 2);

    let mut conn = handle.dedicated_connection().await.unwrap();
    let timeout = Duration::from_secs(1);
    let first = pop_task(&mut conn, &key, timeout).await.unwrap().unwrap();
    let second = pop_task(&mut conn, &key, timeout).await.unwrap().unwrap();
    assert_eq!(first.id(), "first");
    assert_eq!(second.id(), "second");
    assert!(second.dry_run());
    assert!(pop_task(&mut conn, &key, timeout).await.unwrap().is_none());
    assert_eq!(queue.depth().await.unwrap(), 0);
}
