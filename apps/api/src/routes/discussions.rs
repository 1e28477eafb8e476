use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::discussion::DiscussionRow;
use crate::models::job::Job;
use crate::state::AppState;

#[derive(Serialize)]
pub struct DiscussionResponse {
    pub discussion: DiscussionRow,
    /// Oldest first; one entry per processing attempt.
    pub jobs: Vec<Job>,
}

/// GET /api/v1/discussions/:id
pub async fn handle_get_discussion(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DiscussionResponse>, AppError> {
    let discussion = state
        .store
        .get_discussion(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Discussion {id} not found")))?;
    let jobs = state.store.jobs_for_discussion(id).await?;
    Ok(Json(DiscussionResponse { discussion, jobs }))
}

/// GET /api/v1/discussions/:id/jobs
pub async fn handle_list_jobs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Job>>, AppError> {
    if state.store.get_discussion(id).await?.is_none() {
        return Err(AppError::NotFound(format!("Discussion {id} not found")));
    }
    Ok(Json(state.store.jobs_for_discussion(id).await?))
}

/// POST /api/v1/discussions/:id/retry
///
/// Starts a new job for a failed discussion; earlier jobs are left untouched.
pub async fn handle_retry(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.processor.retry(id).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => err.into_response(),
    }
}
