//! Worker-reported event ingestion (C1, SPEC_FULL.md §6.1).
//!
//! A worker reports the outcome of a leased job by posting one of
//! `action_started` / `action_completed` / `action_error`. This handler does
//! nothing but validate and forward to `EventService::emit` — the broker,
//! registered as an `EventListener`, reacts to the append synchronously
//! inside that call. There is no separate "trigger the engine" step.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::snowflake;
use crate::error::AppError;
use crate::services::event::EmitEventRequest;
use crate::state::AppState;

const ALLOWED_EVENT_TYPES: &[&str] = &["action_started", "action_completed", "action_error", "action_failed"];

/// Worker-reported action event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRequest {
    /// Execution this action belongs to.
    pub execution_id: i64,
    /// Step name (matches `Step.step` in the playbook).
    pub node_name: String,
    /// One of `action_started` / `action_completed` / `action_error`.
    pub event_type: String,
    /// Result envelope: `{status, data}` on success, `{status, error}` on failure.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Worker identifier, for lineage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Attempt number, for retry bookkeeping.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<i32>,
}

/// Response for event ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventResponse {
    pub status: String,
    pub event_id: i64,
}

/// POST /api/events
pub async fn handle_event(
    State(state): State<AppState>,
    Json(request): Json<EventRequest>,
) -> Result<Json<EventResponse>, AppError> {
    if !ALLOWED_EVENT_TYPES.contains(&request.event_type.as_str()) {
        return Err(AppError::Validation(format!(
            "unsupported event_type '{}', expected one of {:?}",
            request.event_type, ALLOWED_EVENT_TYPES
        )));
    }

    debug!(
        execution_id = request.execution_id,
        node_name = %request.node_name,
        event_type = %request.event_type,
        "worker event received"
    );

    let node_id = format!("{}:{}", request.execution_id, request.node_name);
    let status = match request.event_type.as_str() {
        "action_started" => "STARTED",
        "action_completed" => "COMPLETED",
        _ => "FAILED",
    };

    let event_id = snowflake::generate(&state.db).await?;
    let response = state
        .events
        .emit(EmitEventRequest {
            event_id,
            execution_id: request.execution_id,
            catalog_id: None,
            event_type: request.event_type.clone(),
            parent_event_id: None,
            parent_execution_id: None,
            node_id: Some(node_id),
            node_name: Some(request.node_name.clone()),
            node_type: Some("step".to_string()),
            status: status.to_string(),
            context: None,
            meta: None,
            result: request.result.clone(),
            worker_id: request.worker_id.clone(),
            attempt: request.attempt,
        })
        .await?;

    Ok(Json(EventResponse {
        status: "ok".to_string(),
        event_id: response.event_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_request_parses_minimal() {
        let json = r#"{"execution_id": 123, "node_name": "start", "event_type": "action_completed"}"#;
        let request: EventRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.execution_id, 123);
        assert_eq!(request.event_type, "action_completed");
        assert!(request.result.is_none());
    }

    #[test]
    fn test_event_response_serialization() {
        let response = EventResponse {
            status: "ok".to_string(),
            event_id: 12345,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("ok"));
        assert!(json.contains("12345"));
    }
}
