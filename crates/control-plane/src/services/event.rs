//! Event service for event sourcing operations (C1, SPEC_FULL.md §4.1).
//!
//! SECURITY: All event context, result, and metadata are sanitized before storage
//! to prevent sensitive data (bearer tokens, passwords, API keys) from being persisted.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::db::models::{Event, EventType};
use crate::db::queries::event::{self as queries, NewEvent};
use crate::db::DbPool;
use crate::error::AppResult;
use crate::sanitize::sanitize_sensitive_data;

/// Anything that wants to be woken up after an event is durably appended.
/// The broker is the primary listener; failures are the listener's own
/// responsibility to log — a listener must never panic or abort the append.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &Event);
}

/// Request to emit an event (maps to the `POST /events` body, §6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitEventRequest {
    pub event_id: i64,
    pub execution_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_id: Option<i64>,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<i32>,
}

/// Response after emitting an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitEventResponse {
    pub event_id: i64,
}

/// Execution status derived from events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub execution_id: i64,
    pub status: String,
    pub event_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_event: Option<Event>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Step status derived from events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStatus {
    pub step_name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub events: Vec<Event>,
}

/// Service for event operations; the only writer of `noetl.event`.
#[derive(Clone)]
pub struct EventService {
    pool: DbPool,
    listeners: Arc<RwLock<Vec<Arc<dyn EventListener>>>>,
}

impl EventService {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a listener invoked after every successful append. The broker
    /// registers itself here at startup so that `route_event` is driven by
    /// append, not by a polling loop.
    pub async fn register_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Emit a new event. Context/meta/result are sanitized before storage.
    /// Idempotent marker types (`step_started`, `step_completed`,
    /// `iteration_started`) are inserted through the idempotency guard;
    /// all other types are inserted unconditionally.
    pub async fn emit(&self, request: EmitEventRequest) -> AppResult<EmitEventResponse> {
        let catalog_id = match request.catalog_id {
            Some(id) => id,
            None => queries::resolve_catalog_id(&self.pool, request.execution_id).await?,
        };

        let sanitized_context = request.context.as_ref().map(sanitize_sensitive_data);
        let sanitized_meta = request.meta.as_ref().map(sanitize_sensitive_data);
        let sanitized_result = request.result.as_ref().map(sanitize_sensitive_data);

        let event_type = EventType::from(request.event_type.as_str());
        let new_event = NewEvent {
            event_id: request.event_id,
            execution_id: request.execution_id,
            catalog_id,
            parent_event_id: request.parent_event_id,
            parent_execution_id: request.parent_execution_id,
            event_type: &request.event_type,
            node_id: request.node_id.as_deref(),
            node_name: request.node_name.as_deref(),
            node_type: request.node_type.as_deref(),
            status: &request.status,
            context: sanitized_context.as_ref(),
            meta: sanitized_meta.as_ref(),
            result: sanitized_result.as_ref(),
            worker_id: request.worker_id.as_deref(),
            attempt: request.attempt,
            duration: None,
        };

        let event_id = if event_type.is_idempotent_marker() {
            let iteration_index = new_event
                .meta
                .and_then(|m| m.get("iteration_index"))
                .and_then(|v| v.as_i64());
            queries::insert_event_guarded(&self.pool, &new_event, iteration_index).await?
        } else {
            queries::insert_event(&self.pool, &new_event).await?
        };

        self.notify(event_id).await;

        Ok(EmitEventResponse { event_id })
    }

    /// Fetch the just-appended event and fan it out to listeners, then, per
    /// §4.1, trigger parent-execution re-evaluation when applicable.
    async fn notify(&self, event_id: i64) {
        let event = match queries::get_event_by_id(&self.pool, event_id).await {
            Ok(Some(e)) => e,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(event_id, error = %err, "failed to reload event for notification");
                return;
            }
        };

        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            listener.on_event(&event).await;
        }

        let triggers_parent_reeval = matches!(
            event.event_type.as_str(),
            "execution_completed" | "execution_failed" | "iterator_completed"
        );
        if triggers_parent_reeval {
            if let Some(parent_execution_id) = event.parent_execution_id {
                match queries::get_latest_event(&self.pool, parent_execution_id, None).await {
                    Ok(Some(parent_event)) => {
                        for listener in listeners.iter() {
                            listener.on_event(&parent_event).await;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(parent_execution_id, error = %err, "failed to load parent execution's latest event");
                    }
                }
            }
        }
    }

    /// Emit `execution_started` for a newly planned execution.
    ///
    /// SECURITY: workload and requestor info are sanitized before storing.
    #[allow(clippy::too_many_arguments)]
    pub async fn emit_execution_started(
        &self,
        event_id: i64,
        execution_id: i64,
        catalog_id: i64,
        path: &str,
        version: i32,
        workload: &serde_json::Value,
        parent_execution_id: Option<i64>,
        parent_event_id: Option<i64>,
    ) -> AppResult<i64> {
        let sanitized_workload = sanitize_sensitive_data(workload);

        let mut context = serde_json::json!({
            "catalog_id": catalog_id,
            "execution_id": execution_id,
            "path": path,
            "version": version,
            "workload": sanitized_workload,
        });
        if let Some(pid) = parent_execution_id {
            context["parent_execution_id"] = serde_json::json!(pid);
        }

        let meta = serde_json::json!({ "emitted_at": Utc::now().to_rfc3339() });

        let new_event = NewEvent {
            event_id,
            execution_id,
            catalog_id,
            parent_event_id,
            parent_execution_id,
            event_type: "execution_started",
            node_id: Some("execution"),
            node_name: Some(path),
            node_type: Some("execution"),
            status: "STARTED",
            context: Some(&context),
            meta: Some(&meta),
            result: None,
            worker_id: None,
            attempt: None,
            duration: None,
        };
        let id = queries::insert_event(&self.pool, &new_event).await?;
        self.notify(id).await;
        Ok(id)
    }

    /// Emit `workflow_initialized` immediately after planning.
    pub async fn emit_workflow_initialized(
        &self,
        event_id: i64,
        execution_id: i64,
        catalog_id: i64,
        parent_event_id: i64,
        step_count: i32,
        transition_count: i32,
    ) -> AppResult<i64> {
        let context = serde_json::json!({
            "step_count": step_count,
            "transition_count": transition_count,
        });
        let meta = serde_json::json!({ "emitted_at": Utc::now().to_rfc3339() });

        let new_event = NewEvent {
            event_id,
            execution_id,
            catalog_id,
            parent_event_id: Some(parent_event_id),
            parent_execution_id: None,
            event_type: "workflow_initialized",
            node_id: Some("workflow"),
            node_name: Some("workflow"),
            node_type: Some("workflow"),
            status: "COMPLETED",
            context: Some(&context),
            meta: Some(&meta),
            result: None,
            worker_id: None,
            attempt: None,
            duration: None,
        };
        let id = queries::insert_event(&self.pool, &new_event).await?;
        self.notify(id).await;
        Ok(id)
    }

    pub async fn get_event(&self, event_id: i64) -> AppResult<Option<Event>> {
        queries::get_event_by_id(&self.pool, event_id).await
    }

    pub async fn get_events(
        &self,
        execution_id: i64,
        event_type: Option<&str>,
        limit: Option<i64>,
    ) -> AppResult<Vec<Event>> {
        queries::get_events_by_execution(&self.pool, execution_id, event_type, limit).await
    }

    pub async fn get_events_by_types(
        &self,
        execution_id: i64,
        event_types: &[&str],
    ) -> AppResult<Vec<Event>> {
        queries::get_events_by_types(&self.pool, execution_id, event_types).await
    }

    pub async fn get_latest_event(
        &self,
        execution_id: i64,
        event_type: Option<&str>,
    ) -> AppResult<Option<Event>> {
        queries::get_latest_event(&self.pool, execution_id, event_type).await
    }

    pub async fn get_execution_status(&self, execution_id: i64) -> AppResult<ExecutionStatus> {
        let class = queries::classify_execution(&self.pool, execution_id).await?;
        let event_count = queries::count_events(&self.pool, execution_id, None).await?;
        let latest_event = queries::get_latest_event(&self.pool, execution_id, None).await?;

        let status = match class {
            queries::ExecutionClass::Initial => "PENDING",
            queries::ExecutionClass::InProgress => "RUNNING",
            queries::ExecutionClass::Completed => {
                if queries::has_event_type(&self.pool, execution_id, "execution_failed").await? {
                    "FAILED"
                } else {
                    "COMPLETED"
                }
            }
        }
        .to_string();

        let start_event =
            queries::get_execution_started_event(&self.pool, execution_id).await?;
        let started_at = start_event.map(|e| e.created_at);

        let completed_at = if status == "COMPLETED" || status == "FAILED" {
            latest_event.as_ref().map(|e| e.created_at)
        } else {
            None
        };

        Ok(ExecutionStatus {
            execution_id,
            status,
            event_count,
            latest_event,
            started_at,
            completed_at,
        })
    }

    pub async fn get_step_status(
        &self,
        execution_id: i64,
        step_name: &str,
    ) -> AppResult<StepStatus> {
        let events = queries::get_events_by_step(&self.pool, execution_id, step_name).await?;
        let result = queries::get_step_result(&self.pool, execution_id, step_name).await?;

        let status = if events.is_empty() {
            "PENDING".to_string()
        } else {
            let last_event = events.last().unwrap();
            match last_event.event_type.as_str() {
                "step_started" => "STARTED".to_string(),
                "action_completed" | "iterator_completed" | "step_completed" => {
                    "COMPLETED".to_string()
                }
                "action_failed" | "step_failed_terminal" => "FAILED".to_string(),
                _ => last_event.status.clone(),
            }
        };

        Ok(StepStatus {
            step_name: step_name.to_string(),
            status,
            result,
            events,
        })
    }

    pub async fn get_all_step_results(
        &self,
        execution_id: i64,
    ) -> AppResult<Vec<(String, serde_json::Value)>> {
        queries::get_all_step_results(&self.pool, execution_id).await
    }

    pub async fn get_steps_pending_completion(&self, execution_id: i64) -> AppResult<Vec<String>> {
        queries::get_steps_pending_completion(&self.pool, execution_id).await
    }

    pub async fn classify_execution(
        &self,
        execution_id: i64,
    ) -> AppResult<queries::ExecutionClass> {
        queries::classify_execution(&self.pool, execution_id).await
    }

    pub async fn get_events_since(
        &self,
        execution_id: i64,
        since: DateTime<Utc>,
    ) -> AppResult<Vec<Event>> {
        queries::get_events_since(&self.pool, execution_id, since).await
    }

    pub async fn get_execution_started_event(&self, execution_id: i64) -> AppResult<Option<Event>> {
        queries::get_execution_started_event(&self.pool, execution_id).await
    }

    pub async fn count_events(
        &self,
        execution_id: i64,
        event_type: Option<&str>,
    ) -> AppResult<i64> {
        queries::count_events(&self.pool, execution_id, event_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_event_request_serialization() {
        let request = EmitEventRequest {
            event_id: 12345,
            execution_id: 67890,
            catalog_id: Some(11111),
            event_type: "execution_started".to_string(),
            parent_event_id: None,
            parent_execution_id: None,
            node_id: Some("execution".to_string()),
            node_name: Some("test-playbook".to_string()),
            node_type: Some("execution".to_string()),
            status: "STARTED".to_string(),
            context: Some(serde_json::json!({"key": "value"})),
            meta: None,
            result: None,
            worker_id: None,
            attempt: None,
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("execution_started"));
        assert!(json.contains("12345"));
        assert!(!json.contains("parent_event_id"));
        assert!(!json.contains("\"meta\""));
    }

    #[test]
    fn test_execution_status_serialization() {
        let status = ExecutionStatus {
            execution_id: 12345,
            status: "RUNNING".to_string(),
            event_count: 5,
            latest_event: None,
            started_at: Some(Utc::now()),
            completed_at: None,
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("RUNNING"));
        assert!(json.contains("started_at"));
        assert!(!json.contains("completed_at"));
    }

    #[test]
    fn test_step_status_serialization() {
        let status = StepStatus {
            step_name: "step1".to_string(),
            status: "COMPLETED".to_string(),
            result: Some(serde_json::json!({"output": "success"})),
            events: vec![],
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("step1"));
        assert!(json.contains("COMPLETED"));
    }
}
