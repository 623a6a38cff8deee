use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use dockhand::api::router;
use dockhand::config::{ServiceConfig, TimeoutConfig};
use dockhand::service::Service;

/// In-memory service with fast dry runs, plus its router.
fn create_test_app() -> (Service, Router) {
    let config = ServiceConfig::default()
        .with_max_concurrent_tasks(3)
        .with_timeouts(TimeoutConfig {
            dry_run_step_delay: Duration::from_millis(5),
            ..TimeoutConfig::default()
        });
    let service = Service::with_redis(config, None);
    let app = router(service.api_state());
    (service, app)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn wait_for_state(app: &Router, id: &str, state: &str) -> Value {
    for _ in 0..500 {
        let (status, job) = send(app, get(&format!("/jobs/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        if job["state"] == state {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never reached {state}");
}

fn dry_deploy_body() -> Value {
    json!({
        "kind": "deploy",
        "mappings": { "web": "registry.example.com/web:5" },
        "dry_run": true
    })
}

#[tokio::test]
async fn test_health() {
    let (_service, app) = create_test_app();
    let (status, body) = send(&app, get("/healthz")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], "memory");
    assert_eq!(body["queue"], "local");
    assert_eq!(body["slots_total"], 3);
    assert_eq!(body["slots_busy"], 0);
}

#[tokio::test]
async fn test_submit_and_fetch_job() {
    let (_service, app) = create_test_app();
    let (status, body) = send(&app, post_json("/jobs", dry_deploy_body())).await;
    assert_eq!(status, StatusCode::OK);
    let id = body["id"].as_str().unwrap().to_string();

    let job = wait_for_state(&app, &id, "done").await;
    assert_eq!(job["id"], id.as_str());
    let logs = job["logs"].as_array().unwrap();
    assert_eq!(logs.last().unwrap(), "[dry_run] deploy complete");
    assert!(job["created_at"].is_string());
}

#[tokio::test]
async fn test_submit_build_never_returns_credentials() {
    let (_service, app) = create_test_app();
    let (status, body) = send(
        &app,
        post_json(
            "/jobs",
            json!({
                "kind": "build",
                "repo_url": "https://git.example.com/org/app.git",
                "registry": "registry.example.com/app",
                "registry_username": "deployer",
                "registry_password": "registry-s3cret",
                "dry_run": true
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = body["id"].as_str().unwrap().to_string();

    let job = wait_for_state(&app, &id, "done").await;
    assert!(!job.to_string().contains("registry-s3cret"));
}

#[tokio::test]
async fn test_unknown_job_is_404() {
    let (_service, app) = create_test_app();
    let (status, body) = send(&app, get("/jobs/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nope"));

    let (status, _) = send(&app, post("/jobs/nope/resubmit")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_duplicate_id_is_conflict() {
    let (_service, app) = create_test_app();
    let mut body = dry_deploy_body();
    body["id"] = json!("release-42");

    let (status, _) = send(&app, post_json("/jobs", body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let first = wait_for_state(&app, "release-42", "done").await;

    let (status, error) = send(&app, post_json("/jobs", body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(error["error"].as_str().unwrap().contains("release-42"));

    let (_, after) = send(&app, get("/jobs/release-42")).await;
    assert_eq!(after["state"], "done");
    assert_eq!(after["logs"], first["logs"]);
}

#[tokio::test]
async fn test_malformed_submission_is_rejected() {
    let (_service, app) = create_test_app();
    let (status, _) = send(&app, post_json("/jobs", json!({ "kind": "launch" }))).await;
    assert!(status.is_client_error());

    let (status, _) = send(&app, post_json("/jobs", json!({ "kind": "deploy" }))).await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_list_jobs() {
    let (_service, app) = create_test_app();
    let mut ids = Vec::new();
    for _ in 0..3 {
        let (_, body) = send(&app, post_json("/jobs", dry_deploy_body())).await;
        ids.push(body["id"].as_str().unwrap().to_string());
    }

    let (status, body) = send(&app, get("/jobs")).await;
    assert_eq!(status, StatusCode::OK);
    let listed: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|job| job["id"].as_str().unwrap())
        .collect();
    for id in &ids {
        assert!(listed.contains(&id.as_str()));
    }
}

#[tokio::test]
async fn test_resubmit_endpoints() {
    let (_service, app) = create_test_app();
    let (_, body) = send(&app, post_json("/jobs", dry_deploy_body())).await;
    let id = body["id"].as_str().unwrap().to_string();
    wait_for_state(&app, &id, "done").await;

    let (status, body) = send(&app, post(&format!("/jobs/{id}/resubmit"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], false);
    assert_eq!(body["reason"], "already done");

    let (status, body) = send(&app, post(&format!("/jobs/{id}/resubmit?force=true"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["id"], id.as_str());

    let (status, body) = send(&app, post("/jobs/resubmit")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["requeued"].is_array());
    assert!(body["skipped"].is_array());
    assert_eq!(body["errors"], json!([]));
}
