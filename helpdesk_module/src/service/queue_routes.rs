use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use crate::email_queue::{EmailQueueError, QueueStats, QueueStatus, QueuedEmail};
use crate::fetch::FetchSummary;
use crate::processor::BatchReport;

use super::errors::ApiError;
use super::pipeline::PipelineError;
use super::state::AppState;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

pub(super) fn queue_router() -> Router<AppState> {
    Router::new()
        .route("/queue", get(list_queue))
        .route("/queue/stats", get(queue_stats))
        .route("/queue/:id", get(get_queued))
        .route("/queue/:id/retry", post(retry_queued))
        .route("/process", post(process_batch))
        .route("/fetch", post(fetch_mailboxes))
}

#[derive(Debug, Deserialize)]
struct QueueListParams {
    status: Option<String>,
    limit: Option<usize>,
}

async fn queue_stats(State(state): State<AppState>) -> Result<Json<QueueStats>, ApiError> {
    let pipeline = state.pipeline.clone();
    let stats = state
        .blocking(move || pipeline.stats())
        .await?
        .map_err(|err| state.internal(err))?;
    Ok(Json(stats))
}

async fn list_queue(
    State(state): State<AppState>,
    Query(params): Query<QueueListParams>,
) -> Result<Json<Vec<QueuedEmail>>, ApiError> {
    let status = match params.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            raw.parse::<QueueStatus>()
                .map_err(|_| ApiError::validation("status", "The selected status is invalid."))?,
        ),
        None => None,
    };
    let limit = params
        .limit
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .min(MAX_LIST_LIMIT);

    let queue = state.pipeline.queue().clone();
    let rows = state
        .blocking(move || queue.list(status, limit))
        .await?
        .map_err(|err| state.internal(err))?;
    Ok(Json(rows))
}

async fn get_queued(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<QueuedEmail>, ApiError> {
    let id = parse_queue_id(&raw_id)?;
    let queue = state.pipeline.queue().clone();
    let row = state
        .blocking(move || queue.get(&id))
        .await?
        .map_err(|err| state.internal(err))?;
    row.map(Json).ok_or_else(|| queued_not_found(&raw_id))
}

async fn retry_queued(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<QueuedEmail>, ApiError> {
    let id = parse_queue_id(&raw_id)?;
    let queue = state.pipeline.queue().clone();
    let (requeued, row) = state
        .blocking(move || -> Result<_, EmailQueueError> {
            let requeued = queue.requeue(&id)?;
            queue.get(&id).map(|row| (requeued, row))
        })
        .await?
        .map_err(|err| state.internal(err))?;
    match (requeued, row) {
        (_, None) => Err(queued_not_found(&raw_id)),
        (false, Some(_)) => Err(ApiError::validation(
            "status",
            "Only failed emails can be retried.",
        )),
        (true, Some(row)) => Ok(Json(row)),
    }
}

async fn process_batch(State(state): State<AppState>) -> Result<Json<BatchReport>, ApiError> {
    let pipeline = state.pipeline.clone();
    match state.blocking(move || pipeline.process_once()).await? {
        Ok(report) => Ok(Json(report)),
        Err(err) if err.is_locked() => Err(ApiError::Conflict {
            code: "run_in_progress",
            message: "A processing run is already in progress.".to_string(),
        }),
        Err(err) => Err(state.internal(err)),
    }
}

async fn fetch_mailboxes(State(state): State<AppState>) -> Result<Json<FetchSummary>, ApiError> {
    let pipeline = state.pipeline.clone();
    match state.blocking(move || pipeline.fetch_once()).await? {
        Ok(summary) => Ok(Json(summary)),
        Err(err @ PipelineError::FetchDisabled) => Err(ApiError::Unavailable {
            code: "fetch_disabled",
            message: err.to_string(),
        }),
        Err(err) => Err(state.internal(err)),
    }
}

fn parse_queue_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim()).map_err(|_| queued_not_found(raw))
}

fn queued_not_found(raw: &str) -> ApiError {
    ApiError::not_found(
        "queued_email_not_found",
        format!("Queued email {} not found.", raw),
    )
}
