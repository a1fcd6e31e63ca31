//! Queue management endpoints.

use axum::extract::{Path, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use conveyor_core::QueueEntryId;
use conveyor_core::queue::{
    ConfigUpdate, JobMetadata, NewJob, Priority, QueueConfig, QueueEntry, TriggerSource,
};
use conveyor_scheduler::{QueueSnapshot, SchedulerStats};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(add_job))
        .route("/status", get(queue_status))
        .route("/stats", get(queue_stats))
        .route("/config", put(update_config))
        .route("/toggle", post(toggle_processing))
        .route("/{id}", get(get_entry).delete(cancel_entry))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddJobRequest {
    #[serde(default)]
    job_id: String,
    priority: Option<Priority>,
    estimated_time: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AddJobResponse {
    queue_job_id: QueueEntryId,
    status: &'static str,
}

/// Manually queue a configured job.
async fn add_job(
    State(state): State<AppState>,
    Json(req): Json<AddJobRequest>,
) -> Result<Json<AddJobResponse>, ApiError> {
    if req.job_id.trim().is_empty() {
        return Err(ApiError::BadRequest("jobId is required".to_string()));
    }

    let job = state.registry.get_job(&req.job_id).await?;

    let mut submission = NewJob::from_definition(&job)
        .with_priority(req.priority.unwrap_or_default())
        .with_metadata(JobMetadata {
            source: TriggerSource::Manual,
            branch: Some(job.branch.clone()),
            commit_hash: None,
            triggered_by: Some("api".to_string()),
        });
    if let Some(max_retries) = req.max_retries {
        submission = submission.with_max_retries(max_retries);
    }
    if let Some(estimated_time) = req.estimated_time {
        submission.estimated_time = estimated_time;
    }

    let queue_job_id = state.scheduler.add_job(submission).await?;
    info!(job_id = %job.id, queue_id = %queue_job_id, "Job queued manually");

    Ok(Json(AddJobResponse {
        queue_job_id,
        status: "queued",
    }))
}

async fn queue_status(State(state): State<AppState>) -> Json<QueueSnapshot> {
    Json(state.scheduler.queue_status().await)
}

async fn queue_stats(State(state): State<AppState>) -> Json<SchedulerStats> {
    Json(state.scheduler.stats().await)
}

async fn get_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QueueEntry>, ApiError> {
    let id = parse_id(&id)?;
    state
        .scheduler
        .get_job(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("queue entry {}", id)))
}

async fn cancel_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    if state.scheduler.cancel_job(&id).await {
        Ok(Json(json!({ "cancelled": true })))
    } else {
        Err(ApiError::NotFound(format!(
            "queue entry {} not found or already finished",
            id
        )))
    }
}

async fn update_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> Result<Json<QueueConfig>, ApiError> {
    let config = state.scheduler.update_config(update).await?;
    Ok(Json(config))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ToggleAction {
    Start,
    Stop,
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    action: ToggleAction,
}

async fn toggle_processing(
    State(state): State<AppState>,
    Json(req): Json<ToggleRequest>,
) -> Json<Value> {
    match req.action {
        ToggleAction::Start => state.scheduler.start_processing().await,
        ToggleAction::Stop => state.scheduler.stop_processing().await,
    }
    Json(json!({ "processing": state.scheduler.is_processing().await }))
}

fn parse_id(raw: &str) -> Result<QueueEntryId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid queue entry id: {}", raw)))
}
