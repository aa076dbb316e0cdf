use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::intake::register::{register_receipt, RegisterRequest, RegisterResponse};
use crate::models::job::{ProcessingJob, DEFAULT_PRIORITY};
use crate::models::receipt::{Item, Receipt};
use crate::state::AppState;

/// Persisted record shape: receipt fields plus ordered items.
#[derive(Serialize)]
pub struct ReceiptDetail {
    #[serde(flatten)]
    pub receipt: Receipt,
    pub items: Vec<Item>,
}

#[derive(Deserialize, Default)]
pub struct EnqueueRequest {
    pub priority: Option<i32>,
}

#[derive(Serialize)]
pub struct EnqueueResponse {
    pub job_id: Uuid,
    pub receipt_id: Uuid,
}

/// POST /api/v1/receipts
pub async fn handle_register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), AppError> {
    let response = register_receipt(state.receipts.as_ref(), state.queue.as_ref(), &req).await?;
    let status = if response.deduplicated {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(response)))
}

/// GET /api/v1/receipts/:id
pub async fn handle_get_receipt(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReceiptDetail>, AppError> {
    let receipt = state
        .receipts
        .get_receipt(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("receipt {id}")))?;
    let items = state.receipts.get_items(id).await?;
    Ok(Json(ReceiptDetail { receipt, items }))
}

/// POST /api/v1/receipts/:id/jobs
/// Re-enqueues a receipt, e.g. after a permanent failure. 409 if a job is active.
pub async fn handle_enqueue(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<EnqueueRequest>>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    let priority = body
        .and_then(|Json(req)| req.priority)
        .unwrap_or(DEFAULT_PRIORITY);
    let job_id = state.queue.enqueue(id, priority).await?;
    Ok((
        StatusCode::CREATED,
        Json(EnqueueResponse {
            job_id,
            receipt_id: id,
        }),
    ))
}

/// GET /api/v1/receipts/:id/jobs
pub async fn handle_receipt_jobs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ProcessingJob>>, AppError> {
    if state.receipts.get_receipt(id).await?.is_none() {
        return Err(AppError::NotFound(format!("receipt {id}")));
    }
    Ok(Json(state.queue.jobs_for_receipt(id).await?))
}

/// GET /api/v1/jobs/:id
pub async fn handle_get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProcessingJob>, AppError> {
    state
        .queue
        .get_job(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("job {id}")))
}
