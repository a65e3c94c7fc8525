//! HTTP surface of the dispatcher.
//!
//! Handlers are thin: decode, call the matching `Dispatcher` method, encode.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::warn;

use spindle_core::api::{
    DeletedResponse, EnabledResponse, HeartbeatResponse, NextTaskRequest, PutPullRequest,
    PutTaskRequest, PutTaskResponse, RegisterServiceRequest, RegisterServiceResponse,
    ReleasedResponse, ResourceRequest, ResourceResponse, TaskCompleteRequest,
    TaskCompleteResponse, TaskStatusQuery, UpdatedResponse,
};
use spindle_core::app::{Dispatcher, DivisionStatus, OfflineResources};
use spindle_core::division::ResetFailedReport;
use spindle_core::domain::{ErrorKind, Lease, QueueName, SchedulerError, ServiceId};
use spindle_core::restore::Band;

type AppState = Arc<Dispatcher>;

/// Scheduler errors mapped onto HTTP status codes.
pub struct AppError(SchedulerError);

impl From<SchedulerError> for AppError {
    fn from(err: SchedulerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = match self.0.kind() {
            ErrorKind::Protocol => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Infrastructure => {
                warn!(error = %self.0, "store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (code, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, AppError>;

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    let tape = Router::new()
        .route("/nexttask", post(next_task))
        .route("/taskcomplete", put(task_complete))
        .route("/task", put(put_task))
        .route("/heartbeat/{division}/{service}", get(heartbeat))
        .route("/service", post(register_service))
        .route("/releaselockedvolume/{division}/{volume}", put(release_volume))
        .route("/pull/{pull_queue_id}", put(put_pull))
        .route("/pull/{division}/enable/{band}", put(enable_band))
        .route("/pull/{division}/file/{file_id}", delete(delete_pending_restores))
        .route("/resourceoffline", post(resource_offline))
        .route("/resourceonline", post(resource_online))
        .route("/resources/{division}", get(offline_resources))
        .route("/taskstatus", get(task_status))
        .route("/tasklist/{division}", get(task_list))
        .route("/resetfailed/{division}", post(reset_failed));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api/tape", tape)
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn next_task(
    State(dispatcher): State<AppState>,
    Json(req): Json<NextTaskRequest>,
) -> ApiResult<Option<Lease>> {
    Ok(Json(dispatcher.next_task(req).await?))
}

async fn task_complete(
    State(dispatcher): State<AppState>,
    Json(req): Json<TaskCompleteRequest>,
) -> ApiResult<TaskCompleteResponse> {
    let completed = dispatcher.task_complete(req).await?;
    Ok(Json(TaskCompleteResponse { completed }))
}

async fn put_task(
    State(dispatcher): State<AppState>,
    Json(req): Json<PutTaskRequest>,
) -> ApiResult<PutTaskResponse> {
    let queued = dispatcher.put_task(req).await?;
    Ok(Json(PutTaskResponse { queued }))
}

async fn heartbeat(
    State(dispatcher): State<AppState>,
    Path((division, service)): Path<(String, ServiceId)>,
) -> ApiResult<HeartbeatResponse> {
    Ok(Json(dispatcher.heartbeat(&division, service).await?))
}

async fn register_service(
    State(dispatcher): State<AppState>,
    Json(req): Json<RegisterServiceRequest>,
) -> ApiResult<RegisterServiceResponse> {
    let service = dispatcher.register_service(req).await?;
    Ok(Json(RegisterServiceResponse { service }))
}

async fn release_volume(
    State(dispatcher): State<AppState>,
    Path((division, volume)): Path<(String, String)>,
) -> ApiResult<ReleasedResponse> {
    let released = dispatcher.release_volume(&division, &volume).await?;
    Ok(Json(ReleasedResponse { released }))
}

async fn put_pull(
    State(dispatcher): State<AppState>,
    Path(pull_queue_id): Path<i64>,
    Json(req): Json<PutPullRequest>,
) -> ApiResult<UpdatedResponse> {
    dispatcher.put_pull(pull_queue_id, req).await?;
    Ok(Json(UpdatedResponse { updated: true }))
}

async fn enable_band(
    State(dispatcher): State<AppState>,
    Path((division, band)): Path<(String, Band)>,
) -> ApiResult<EnabledResponse> {
    let priorities = dispatcher.enable_band(&division, band).await?;
    Ok(Json(EnabledResponse { priorities }))
}

async fn delete_pending_restores(
    State(dispatcher): State<AppState>,
    Path((division, file_id)): Path<(String, i64)>,
) -> ApiResult<DeletedResponse> {
    let deleted = dispatcher.delete_pending_restores(&division, file_id).await?;
    Ok(Json(DeletedResponse { deleted }))
}

async fn resource_offline(
    State(dispatcher): State<AppState>,
    Json(req): Json<ResourceRequest>,
) -> ApiResult<ResourceResponse> {
    Ok(Json(dispatcher.resource_offline(req).await?))
}

async fn resource_online(
    State(dispatcher): State<AppState>,
    Json(req): Json<ResourceRequest>,
) -> ApiResult<ResourceResponse> {
    Ok(Json(dispatcher.resource_online(req).await?))
}

async fn offline_resources(
    State(dispatcher): State<AppState>,
    Path(division): Path<String>,
) -> ApiResult<OfflineResources> {
    Ok(Json(dispatcher.offline_resources(&division).await?))
}

async fn task_status(
    State(dispatcher): State<AppState>,
    Query(query): Query<TaskStatusQuery>,
) -> Json<BTreeMap<String, DivisionStatus>> {
    Json(dispatcher.task_status(query.reset).await)
}

async fn task_list(
    State(dispatcher): State<AppState>,
    Path(division): Path<String>,
) -> ApiResult<BTreeMap<QueueName, BTreeMap<String, Vec<Value>>>> {
    Ok(Json(dispatcher.task_list(&division).await?))
}

async fn reset_failed(
    State(dispatcher): State<AppState>,
    Path(division): Path<String>,
) -> ApiResult<ResetFailedReport> {
    Ok(Json(dispatcher.reset_failed(&division).await?))
}
