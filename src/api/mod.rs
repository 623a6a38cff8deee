use std::net::SocketAddr;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::DockhandError;
use crate::queue::JobService;
use crate::store::Job;
use crate::task::{TaskExecutor, TaskSpec};

#[derive(Clone)]
pub struct ApiState {
    pub service: JobService,
    pub executor: TaskExecutor,
}

#[derive(Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub id: String,
}

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
    pub queue: String,
    pub slots_total: usize,
    pub slots_busy: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Deserialize, Default)]
pub struct ResubmitQuery {
    #[serde(default)]
    pub force: bool,
}

/// Error returned by handlers, rendered as `{"error": "..."}`.
pub struct ApiError(DockhandError);

impl From<DockhandError> for ApiError {
    fn from(e: DockhandError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            DockhandError::JobNotFound(_) => StatusCode::NOT_FOUND,
            DockhandError::JobExists(_) => StatusCode::CONFLICT,
            DockhandError::Precondition(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(health_handler))
        .route("/jobs", get(list_jobs_handler).post(submit_job_handler))
        .route("/jobs/resubmit", post(resubmit_all_handler))
        .route("/jobs/:id", get(get_job_handler))
        .route("/jobs/:id/resubmit", post(resubmit_job_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn run_api(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> crate::error::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("HTTP API stopped");
    Ok(())
}

async fn health_handler(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        store: state.service.store().backend().to_string(),
        queue: state.service.queue_name().to_string(),
        slots_total: state.executor.capacity(),
        slots_busy: state.executor.busy_slots(),
    })
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    Json(spec): Json<TaskSpec>,
) -> Result<Json<SubmitJobResponse>, ApiError> {
    let id = state.service.submit(spec).await?;
    Ok(Json(SubmitJobResponse { id }))
}

async fn list_jobs_handler(State(state): State<ApiState>) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.service.list().await?))
}

async fn get_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    match state.service.get(&id).await? {
        Some(job) => Ok(Json(job)),
        None => Err(DockhandError::JobNotFound(id).into()),
    }
}

async fn resubmit_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<ResubmitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.resubmit(&id, query.force).await?))
}

async fn resubmit_all_handler(
    State(state): State<ApiState>,
    Query(query): Query<ResubmitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.resubmit_all(query.force).await?))
}
