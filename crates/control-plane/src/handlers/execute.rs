//! Execution API handlers.
//!
//! Handles playbook execution start.

use std::collections::HashMap;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::models::CatalogEntryRequest;
use crate::db::snowflake;
use crate::error::AppError;
use crate::state::AppState;

/// Request to start playbook execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Playbook catalog path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Catalog ID (alternative to path).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_id: Option<i64>,
    /// Input payload/workload.
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
    /// Parent execution ID (for nested executions).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<i64>,
}

impl ExecuteRequest {
    /// Validate the request.
    pub fn validate(&self) -> Result<(), String> {
        if self.path.is_none() && self.catalog_id.is_none() {
            return Err("Either 'path' or 'catalog_id' must be provided".to_string());
        }
        Ok(())
    }
}

/// Response for starting execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    /// Execution ID.
    pub execution_id: String,
    /// Execution status.
    pub status: String,
}

/// Start playbook execution.
///
/// POST /api/execute
///
/// Resolves the catalog entry, emits `execution_started`, and returns. The
/// broker — registered as an `EventListener` on `EventService` at startup —
/// reacts to that append and dispatches the `start` step; this handler does
/// not touch the queue directly.
pub async fn execute(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, AppError> {
    request.validate().map_err(AppError::Validation)?;

    let entry = state
        .catalog
        .get_resource(CatalogEntryRequest {
            catalog_id: request.catalog_id.map(|id| id.to_string()),
            path: request.path.clone(),
            version: None,
        })
        .await?;

    info!(path = %entry.path, catalog_id = entry.id, "starting execution");

    let execution_id = snowflake::generate(&state.db).await?;
    let event_id = snowflake::generate(&state.db).await?;
    let workload = serde_json::to_value(&request.payload)
        .map_err(|e| AppError::Internal(format!("failed to serialize payload: {e}")))?;

    state
        .events
        .emit_execution_started(
            event_id,
            execution_id,
            entry.id,
            &entry.path,
            entry.version,
            &workload,
            request.parent_execution_id,
            None,
        )
        .await?;

    Ok(Json(ExecuteResponse {
        execution_id: execution_id.to_string(),
        status: "started".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_request_validation() {
        let request = ExecuteRequest {
            path: None,
            catalog_id: None,
            payload: HashMap::new(),
            parent_execution_id: None,
        };
        assert!(request.validate().is_err());

        let request = ExecuteRequest {
            path: Some("test/playbook".to_string()),
            catalog_id: None,
            payload: HashMap::new(),
            parent_execution_id: None,
        };
        assert!(request.validate().is_ok());

        let request = ExecuteRequest {
            path: None,
            catalog_id: Some(12345),
            payload: HashMap::new(),
            parent_execution_id: None,
        };
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_execute_response_serialization() {
        let response = ExecuteResponse {
            execution_id: "12345".to_string(),
            status: "started".to_string(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("12345"));
        assert!(json.contains("started"));
    }
}
