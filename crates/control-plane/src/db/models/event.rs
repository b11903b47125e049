//! Event model for execution event sourcing.
//!
//! All workflow state is derived from events stored in the event table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Event types for workflow execution. Closed vocabulary — every event
/// persisted by the broker, worker pool, retry evaluator, or iterator
/// controller uses one of these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Root event of an execution; carries catalog_id and the rendered workload.
    ExecutionStarted,
    /// Planner has persisted workflow/workbook/transition rows.
    WorkflowInitialized,
    /// A step has been dispatched (idempotent marker).
    StepStarted,
    /// A worker has begun executing a job for a step.
    ActionStarted,
    /// A worker finished a job successfully; carries the result envelope.
    ActionCompleted,
    /// A worker's job raised a recoverable error.
    ActionError,
    /// A worker's job failed in a way that will not be retried.
    ActionFailed,
    /// Non-worker-originated step result (e.g. iterator synthesis).
    StepResult,
    /// Step transitions evaluated and marked done (idempotent marker).
    StepCompleted,
    /// Retry evaluator requeued the step with a computed delay.
    StepRetry,
    /// Retry evaluator ran out of policies/attempts for the step.
    StepRetryExhausted,
    /// Step is terminally failed; no further attempts will be made.
    StepFailedTerminal,
    /// One iteration of a loop/iterator step has begun (idempotent marker, keyed with iteration_index).
    IterationStarted,
    /// All iterations of a loop/iterator step have completed and been aggregated.
    IteratorCompleted,
    /// The execution has reached a terminal success state.
    ExecutionCompleted,
    /// The execution has reached a terminal failure state.
    ExecutionFailed,
    /// Custom event type, preserved for forward compatibility with unknown producers.
    Custom(String),
}

impl EventType {
    /// True for event types that must be inserted through the idempotency guard
    /// (at most one per `(execution_id, node_name, event_type[, iteration_index])`).
    pub fn is_idempotent_marker(&self) -> bool {
        matches!(
            self,
            EventType::StepStarted | EventType::StepCompleted | EventType::IterationStarted
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::ExecutionStarted => "execution_started",
            EventType::WorkflowInitialized => "workflow_initialized",
            EventType::StepStarted => "step_started",
            EventType::ActionStarted => "action_started",
            EventType::ActionCompleted => "action_completed",
            EventType::ActionError => "action_error",
            EventType::ActionFailed => "action_failed",
            EventType::StepResult => "step_result",
            EventType::StepCompleted => "step_completed",
            EventType::StepRetry => "step_retry",
            EventType::StepRetryExhausted => "step_retry_exhausted",
            EventType::StepFailedTerminal => "step_failed_terminal",
            EventType::IterationStarted => "iteration_started",
            EventType::IteratorCompleted => "iterator_completed",
            EventType::ExecutionCompleted => "execution_completed",
            EventType::ExecutionFailed => "execution_failed",
            EventType::Custom(s) => s,
        };
        write!(f, "{}", s)
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "execution_started" => EventType::ExecutionStarted,
            "workflow_initialized" => EventType::WorkflowInitialized,
            "step_started" => EventType::StepStarted,
            "action_started" => EventType::ActionStarted,
            "action_completed" => EventType::ActionCompleted,
            "action_error" => EventType::ActionError,
            "action_failed" => EventType::ActionFailed,
            "step_result" => EventType::StepResult,
            "step_completed" => EventType::StepCompleted,
            "step_retry" => EventType::StepRetry,
            "step_retry_exhausted" => EventType::StepRetryExhausted,
            "step_failed_terminal" => EventType::StepFailedTerminal,
            "iteration_started" => EventType::IterationStarted,
            "iterator_completed" => EventType::IteratorCompleted,
            "execution_completed" => EventType::ExecutionCompleted,
            "execution_failed" => EventType::ExecutionFailed,
            other => EventType::Custom(other.to_string()),
        }
    }
}

/// Event status values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Started,
    Running,
    Completed,
    Failed,
    Retry,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Started => "STARTED",
            EventStatus::Running => "RUNNING",
            EventStatus::Completed => "COMPLETED",
            EventStatus::Failed => "FAILED",
            EventStatus::Retry => "RETRY",
        };
        write!(f, "{}", s)
    }
}

impl EventStatus {
    /// Parse a status string, rejecting anything outside the closed enum.
    /// Used at the API boundary — invalid statuses must produce a 400, not
    /// silently coerce to a default (see `db::models::event` tests).
    pub fn parse(s: &str) -> Result<Self, String> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(EventStatus::Pending),
            "STARTED" => Ok(EventStatus::Started),
            "RUNNING" => Ok(EventStatus::Running),
            "COMPLETED" => Ok(EventStatus::Completed),
            "FAILED" => Ok(EventStatus::Failed),
            "RETRY" => Ok(EventStatus::Retry),
            other => Err(format!(
                "invalid status '{other}', expected one of PENDING, STARTED, RUNNING, COMPLETED, FAILED, RETRY"
            )),
        }
    }
}

/// Database event record.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Event {
    /// Primary key, same value as `event_id` (both are the Snowflake id).
    pub id: i64,

    /// Execution identifier.
    pub execution_id: i64,

    /// Catalog entry ID. Required; resolved via fallback inference on insert.
    pub catalog_id: i64,

    /// Event identifier (Snowflake ID).
    pub event_id: i64,

    /// Parent event ID for lineage.
    pub parent_event_id: Option<i64>,

    /// Parent execution ID (for sub-playbook children).
    pub parent_execution_id: Option<i64>,

    /// Event type (see `EventType`).
    pub event_type: String,

    /// Node identifier, scheme `{execution_id}:{step_name}[:{iteration_index}]`.
    pub node_id: Option<String>,

    /// Node name (step name).
    pub node_name: Option<String>,

    /// Node type (step, workflow, execution, etc.).
    pub node_type: Option<String>,

    /// Event status.
    pub status: String,

    /// Event context (JSON).
    pub context: Option<serde_json::Value>,

    /// Event metadata (JSON).
    pub meta: Option<serde_json::Value>,

    /// Result data (JSON) — the envelope for action_completed/action_error.
    pub result: Option<serde_json::Value>,

    /// Worker ID (for worker-originated events).
    pub worker_id: Option<String>,

    /// Attempt number (for retries).
    pub attempt: Option<i32>,

    /// Duration in milliseconds, when applicable.
    pub duration: Option<i64>,

    /// When the event was created.
    pub created_at: DateTime<Utc>,
}

/// Request to create a new event (API boundary shape, §6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCreateRequest {
    pub execution_id: i64,
    #[serde(default)]
    pub catalog_id: Option<i64>,
    pub parent_event_id: Option<i64>,
    pub parent_execution_id: Option<i64>,
    pub event_type: String,
    pub node_id: Option<String>,
    pub node_name: Option<String>,
    pub node_type: Option<String>,
    pub status: String,
    pub context: Option<serde_json::Value>,
    pub meta: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub worker_id: Option<String>,
    pub attempt: Option<i32>,
    pub duration: Option<i64>,
}

/// Event response for API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventResponse {
    pub event_id: String,
    pub execution_id: String,
    pub event_type: String,
    pub node_name: Option<String>,
    pub status: String,
    pub context: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl From<Event> for EventResponse {
    fn from(e: Event) -> Self {
        Self {
            event_id: e.event_id.to_string(),
            execution_id: e.execution_id.to_string(),
            event_type: e.event_type,
            node_name: e.node_name,
            status: e.status,
            context: e.context,
            result: e.result,
            created_at: e.created_at,
        }
    }
}

/// List of events response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventListResponse {
    pub events: Vec<EventResponse>,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_display() {
        assert_eq!(EventType::ExecutionStarted.to_string(), "execution_started");
        assert_eq!(
            EventType::WorkflowInitialized.to_string(),
            "workflow_initialized"
        );
        assert_eq!(EventType::IteratorCompleted.to_string(), "iterator_completed");
        assert_eq!(EventType::StepRetryExhausted.to_string(), "step_retry_exhausted");
    }

    #[test]
    fn test_event_type_from_str_roundtrip() {
        for variant in [
            EventType::ExecutionStarted,
            EventType::WorkflowInitialized,
            EventType::StepStarted,
            EventType::ActionStarted,
            EventType::ActionCompleted,
            EventType::ActionError,
            EventType::ActionFailed,
            EventType::StepResult,
            EventType::StepCompleted,
            EventType::StepRetry,
            EventType::StepRetryExhausted,
            EventType::StepFailedTerminal,
            EventType::IterationStarted,
            EventType::IteratorCompleted,
            EventType::ExecutionCompleted,
            EventType::ExecutionFailed,
        ] {
            let s = variant.to_string();
            assert_eq!(EventType::from(s.as_str()), variant);
        }
        assert_eq!(
            EventType::from("some_custom_event"),
            EventType::Custom("some_custom_event".to_string())
        );
    }

    #[test]
    fn test_idempotent_marker_classification() {
        assert!(EventType::StepStarted.is_idempotent_marker());
        assert!(EventType::StepCompleted.is_idempotent_marker());
        assert!(EventType::IterationStarted.is_idempotent_marker());
        assert!(!EventType::ActionCompleted.is_idempotent_marker());
        assert!(!EventType::ExecutionCompleted.is_idempotent_marker());
    }

    #[test]
    fn test_event_status_parse_rejects_invalid() {
        assert_eq!(EventStatus::parse("completed").unwrap(), EventStatus::Completed);
        assert_eq!(EventStatus::parse("FAILED").unwrap(), EventStatus::Failed);
        assert!(EventStatus::parse("bogus").is_err());
    }
}
