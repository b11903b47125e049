//! Queue entry model (C2, SPEC_FULL.md §3.1/§4.2).
//!
//! A queue entry is the unit of work a worker leases and executes. Status
//! transitions: `queued -> leased -> {done, dead}`, with `queued -> queued`
//! (requeue) on a retryable failure or redelivery sweep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Queue entry status. Closed vocabulary matching the lease lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Leased,
    Done,
    Dead,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Leased => "leased",
            QueueStatus::Done => "done",
            QueueStatus::Dead => "dead",
        };
        write!(f, "{}", s)
    }
}

impl From<&str> for QueueStatus {
    fn from(s: &str) -> Self {
        match s {
            "queued" => QueueStatus::Queued,
            "leased" => QueueStatus::Leased,
            "done" => QueueStatus::Done,
            "dead" => QueueStatus::Dead,
            other => panic!("unknown queue status '{other}'"),
        }
    }
}

/// A row in `noetl.queue`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueEntry {
    pub queue_id: i64,
    pub execution_id: i64,
    pub catalog_id: i64,
    /// `{execution_id}:{step_name}` or `{execution_id}:{step_name}:{iteration_index}`.
    pub node_id: String,
    pub node_name: String,
    /// Tool kind the worker should dispatch to.
    pub action: String,
    /// Server-rendered task context; workers consume this verbatim.
    pub context: serde_json::Value,
    /// Orchestration metadata: parent_event_id, parent_execution_id, iterator
    /// index/count/item, retry attempt number.
    pub meta: serde_json::Value,
    pub priority: i32,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub available_at: DateTime<Utc>,
    pub lease_until: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_status_display_roundtrip() {
        for status in [
            QueueStatus::Queued,
            QueueStatus::Leased,
            QueueStatus::Done,
            QueueStatus::Dead,
        ] {
            let s = status.to_string();
            assert_eq!(QueueStatus::from(s.as_str()), status);
        }
    }
}
