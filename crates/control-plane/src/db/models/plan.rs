//! Workflow/workbook/transition introspection rows (C4, SPEC_FULL.md §4.4/§6.6).
//!
//! These tables are a snapshot of a parsed playbook taken at plan time, for
//! operator introspection; they are never read back by the broker, which
//! re-parses the catalog entry on every evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row in `noetl.workflow`: one per step in the playbook's `workflow:` list.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorkflowRow {
    pub workflow_id: i64,
    pub execution_id: i64,
    pub catalog_id: i64,
    pub step_name: String,
    pub tool_kind: String,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A row in `noetl.workbook`: one per reusable task in the playbook's
/// `workbook:` list.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorkbookRow {
    pub workbook_id: i64,
    pub execution_id: i64,
    pub catalog_id: i64,
    pub task_name: String,
    pub tool_kind: String,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A row in `noetl.transition`: one per `next:` target declared on a step.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TransitionRow {
    pub transition_id: i64,
    pub execution_id: i64,
    pub catalog_id: i64,
    pub from_step: String,
    pub to_step: String,
    pub when_expr: Option<String>,
    pub created_at: DateTime<Utc>,
}
