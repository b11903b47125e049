//! Queue API handlers (C2, SPEC_FULL.md §6.2).
//!
//! Workers never talk to Postgres directly; this is their only way to lease,
//! heartbeat, complete, or fail a job. Thin wrappers over `QueueService` —
//! all the atomicity (`FOR UPDATE SKIP LOCKED`, `ON CONFLICT DO NOTHING`)
//! lives in `db::queries::queue`.

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::QueueEntry;
use crate::error::AppError;
use crate::services::queue::{HeartbeatResponse, LeaseResponse, DEFAULT_LEASE_SECS, DEFAULT_MAX_ATTEMPTS};
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueRequest {
    pub execution_id: i64,
    pub catalog_id: i64,
    pub node_id: String,
    pub node_name: String,
    pub action: String,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub meta: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub available_at: Option<DateTime<Utc>>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
}

fn default_max_attempts() -> i32 {
    DEFAULT_MAX_ATTEMPTS
}

#[derive(Debug, Clone, Serialize)]
pub struct EnqueueResponse {
    pub queue_id: i64,
}

/// POST /api/queue/enqueue
pub async fn enqueue(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    let queue_id = state
        .queue
        .enqueue(
            request.execution_id,
            request.catalog_id,
            &request.node_id,
            &request.node_name,
            &request.action,
            &request.context,
            &request.meta,
            request.priority,
            request.available_at.unwrap_or_else(Utc::now),
            request.max_attempts,
        )
        .await?;

    Ok(Json(EnqueueResponse { queue_id }))
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaseRequest {
    pub worker_id: String,
    #[serde(default = "default_lease_secs")]
    pub lease_duration_secs: i64,
    #[serde(default)]
    pub action: Option<String>,
}

fn default_lease_secs() -> i64 {
    DEFAULT_LEASE_SECS
}

/// POST /api/queue/lease
pub async fn lease(
    State(state): State<AppState>,
    Json(request): Json<LeaseRequest>,
) -> Result<Json<LeaseResponse>, AppError> {
    let entry = state
        .queue
        .lease(
            &request.worker_id,
            request.lease_duration_secs,
            request.action.as_deref(),
        )
        .await?;

    Ok(Json(LeaseResponse { entry }))
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: String,
    #[serde(default = "default_lease_secs")]
    pub lease_duration_secs: i64,
}

/// POST /api/queue/:queue_id/heartbeat
pub async fn heartbeat(
    State(state): State<AppState>,
    axum::extract::Path(queue_id): axum::extract::Path<i64>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, AppError> {
    let ok = state
        .queue
        .heartbeat(queue_id, &request.worker_id, request.lease_duration_secs)
        .await?;

    Ok(Json(HeartbeatResponse { ok }))
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerIdRequest {
    pub worker_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueEntryResponse {
    pub entry: Option<QueueEntry>,
}

/// POST /api/queue/:queue_id/complete
pub async fn complete(
    State(state): State<AppState>,
    axum::extract::Path(queue_id): axum::extract::Path<i64>,
    Json(request): Json<WorkerIdRequest>,
) -> Result<Json<QueueEntryResponse>, AppError> {
    let entry = state.queue.complete(queue_id, &request.worker_id).await?;
    Ok(Json(QueueEntryResponse { entry }))
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailRequest {
    pub worker_id: String,
    #[serde(default)]
    pub retry_allowed: bool,
    #[serde(default)]
    pub available_at: Option<DateTime<Utc>>,
}

/// POST /api/queue/:queue_id/fail
pub async fn fail(
    State(state): State<AppState>,
    axum::extract::Path(queue_id): axum::extract::Path<i64>,
    Json(request): Json<FailRequest>,
) -> Result<Json<QueueEntryResponse>, AppError> {
    let entry = state
        .queue
        .fail(
            queue_id,
            &request.worker_id,
            request.retry_allowed,
            request.available_at.unwrap_or_else(Utc::now),
        )
        .await?;

    Ok(Json(QueueEntryResponse { entry }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_request_defaults() {
        let json = r#"{"execution_id": 1, "catalog_id": 2, "node_id": "1:start", "node_name": "start", "action": "python"}"#;
        let request: EnqueueRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(request.priority, 0);
    }

    #[test]
    fn test_lease_request_defaults() {
        let json = r#"{"worker_id": "worker-1"}"#;
        let request: LeaseRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.lease_duration_secs, DEFAULT_LEASE_SECS);
        assert!(request.action.is_none());
    }
}
