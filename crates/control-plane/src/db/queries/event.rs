//! Event database queries.
//!
//! All inserts for idempotent marker event types (`step_started`,
//! `step_completed`, `iteration_started`) go through `insert_event_guarded`,
//! which checks for an existing row keyed by
//! `(execution_id, node_name, event_type[, iteration_index])` before
//! inserting (invariant 3 in SPEC_FULL.md §3.2).

use chrono::{DateTime, Utc};

use crate::db::models::{Event, EventType};
use crate::db::DbPool;
use crate::error::{AppError, AppResult};

/// Columns shared by every `SELECT ... FROM noetl.event` in this module.
const EVENT_COLUMNS: &str = r#"
    id, execution_id, catalog_id, event_id, parent_event_id, parent_execution_id,
    event_type, node_id, node_name, node_type, status,
    context, meta, result, worker_id, attempt, duration, created_at
"#;

/// Fields needed to insert a new event row.
#[derive(Debug, Clone)]
pub struct NewEvent<'a> {
    pub event_id: i64,
    pub execution_id: i64,
    pub catalog_id: i64,
    pub parent_event_id: Option<i64>,
    pub parent_execution_id: Option<i64>,
    pub event_type: &'a str,
    pub node_id: Option<&'a str>,
    pub node_name: Option<&'a str>,
    pub node_type: Option<&'a str>,
    pub status: &'a str,
    pub context: Option<&'a serde_json::Value>,
    pub meta: Option<&'a serde_json::Value>,
    pub result: Option<&'a serde_json::Value>,
    pub worker_id: Option<&'a str>,
    pub attempt: Option<i32>,
    pub duration: Option<i64>,
}

/// Unconditional insert. Callers inserting one of the idempotent marker
/// types must use `insert_event_guarded` instead.
pub async fn insert_event(pool: &DbPool, e: &NewEvent<'_>) -> AppResult<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO noetl.event (
            event_id, execution_id, catalog_id, parent_event_id, parent_execution_id,
            event_type, node_id, node_name, node_type, status,
            context, meta, result, worker_id, attempt, duration, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        RETURNING id
        "#,
    )
    .bind(e.event_id)
    .bind(e.execution_id)
    .bind(e.catalog_id)
    .bind(e.parent_event_id)
    .bind(e.parent_execution_id)
    .bind(e.event_type)
    .bind(e.node_id)
    .bind(e.node_name)
    .bind(e.node_type)
    .bind(e.status)
    .bind(e.context)
    .bind(e.meta)
    .bind(e.result)
    .bind(e.worker_id)
    .bind(e.attempt)
    .bind(e.duration)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Insert an idempotent marker event, guarded by `(execution_id, node_name,
/// event_type[, iteration_index])`. Returns the event_id of the row that
/// now exists — either the one just inserted, or the pre-existing one if
/// this is a duplicate.
///
/// `iteration_index` must be `Some` for `iteration_started` and `None` for
/// `step_started`/`step_completed`.
pub async fn insert_event_guarded(
    pool: &DbPool,
    e: &NewEvent<'_>,
    iteration_index: Option<i64>,
) -> AppResult<i64> {
    let node_name = e.node_name.ok_or_else(|| {
        AppError::Validation("idempotent marker events require node_name".to_string())
    })?;

    let existing: Option<(i64,)> = if let Some(idx) = iteration_index {
        sqlx::query_as(
            r#"
            SELECT event_id FROM noetl.event
            WHERE execution_id = $1 AND node_name = $2 AND event_type = $3
              AND (meta->>'iteration_index')::bigint = $4
            LIMIT 1
            "#,
        )
        .bind(e.execution_id)
        .bind(node_name)
        .bind(e.event_type)
        .bind(idx)
        .fetch_optional(pool)
        .await?
    } else {
        sqlx::query_as(
            r#"
            SELECT event_id FROM noetl.event
            WHERE execution_id = $1 AND node_name = $2 AND event_type = $3
            LIMIT 1
            "#,
        )
        .bind(e.execution_id)
        .bind(node_name)
        .bind(e.event_type)
        .fetch_optional(pool)
        .await?
    };

    if let Some((existing_id,)) = existing {
        return Ok(existing_id);
    }

    insert_event(pool, e).await
}

/// Resolve `catalog_id` for an execution that doesn't carry one explicitly:
/// falls back to the `execution_started` event's catalog_id. Returns
/// `MissingCatalogId` only if no prior event exists for the execution.
pub async fn resolve_catalog_id(pool: &DbPool, execution_id: i64) -> AppResult<i64> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT catalog_id FROM noetl.event
        WHERE execution_id = $1
        ORDER BY event_id ASC
        LIMIT 1
        "#,
    )
    .bind(execution_id)
    .fetch_optional(pool)
    .await?;

    row.map(|(c,)| c).ok_or_else(|| {
        AppError::Validation(format!(
            "no prior event for execution_id {execution_id}; catalog_id cannot be inferred"
        ))
    })
}

/// Get an event by event_id.
pub async fn get_event_by_id(pool: &DbPool, event_id: i64) -> AppResult<Option<Event>> {
    let query = format!("SELECT {EVENT_COLUMNS} FROM noetl.event WHERE event_id = $1");
    let event = sqlx::query_as::<_, Event>(&query)
        .bind(event_id)
        .fetch_optional(pool)
        .await?;

    Ok(event)
}

/// Get all events for an execution, in event order.
pub async fn get_events_by_execution(
    pool: &DbPool,
    execution_id: i64,
    event_type: Option<&str>,
    limit: Option<i64>,
) -> AppResult<Vec<Event>> {
    let events = if let Some(et) = event_type {
        let query =
            format!("SELECT {EVENT_COLUMNS} FROM noetl.event WHERE execution_id = $1 AND event_type = $2 ORDER BY event_id ASC LIMIT $3");
        sqlx::query_as::<_, Event>(&query)
            .bind(execution_id)
            .bind(et)
            .bind(limit.unwrap_or(10_000))
            .fetch_all(pool)
            .await?
    } else {
        let query =
            format!("SELECT {EVENT_COLUMNS} FROM noetl.event WHERE execution_id = $1 ORDER BY event_id ASC LIMIT $2");
        sqlx::query_as::<_, Event>(&query)
            .bind(execution_id)
            .bind(limit.unwrap_or(10_000))
            .fetch_all(pool)
            .await?
    };

    Ok(events)
}

/// Get events by execution and multiple event types.
pub async fn get_events_by_types(
    pool: &DbPool,
    execution_id: i64,
    event_types: &[&str],
) -> AppResult<Vec<Event>> {
    let placeholders: Vec<String> = (2..=event_types.len() + 1)
        .map(|i| format!("${}", i))
        .collect();
    let in_clause = placeholders.join(", ");

    let query = format!(
        "SELECT {EVENT_COLUMNS} FROM noetl.event WHERE execution_id = $1 AND event_type IN ({in_clause}) ORDER BY event_id ASC"
    );

    let mut query_builder = sqlx::query_as::<_, Event>(&query).bind(execution_id);
    for et in event_types {
        query_builder = query_builder.bind(*et);
    }

    let events = query_builder.fetch_all(pool).await?;
    Ok(events)
}

/// Get the latest event for an execution, optionally filtered by type.
pub async fn get_latest_event(
    pool: &DbPool,
    execution_id: i64,
    event_type: Option<&str>,
) -> AppResult<Option<Event>> {
    let event = if let Some(et) = event_type {
        let query = format!(
            "SELECT {EVENT_COLUMNS} FROM noetl.event WHERE execution_id = $1 AND event_type = $2 ORDER BY event_id DESC LIMIT 1"
        );
        sqlx::query_as::<_, Event>(&query)
            .bind(execution_id)
            .bind(et)
            .fetch_optional(pool)
            .await?
    } else {
        let query = format!(
            "SELECT {EVENT_COLUMNS} FROM noetl.event WHERE execution_id = $1 ORDER BY event_id DESC LIMIT 1"
        );
        sqlx::query_as::<_, Event>(&query)
            .bind(execution_id)
            .fetch_optional(pool)
            .await?
    };

    Ok(event)
}

/// Get events for a specific step, in event order.
pub async fn get_events_by_step(
    pool: &DbPool,
    execution_id: i64,
    node_name: &str,
) -> AppResult<Vec<Event>> {
    let query =
        format!("SELECT {EVENT_COLUMNS} FROM noetl.event WHERE execution_id = $1 AND node_name = $2 ORDER BY event_id ASC");
    let events = sqlx::query_as::<_, Event>(&query)
        .bind(execution_id)
        .bind(node_name)
        .fetch_all(pool)
        .await?;

    Ok(events)
}

/// Latest `action_completed` (or synthetic `iterator_completed`) result for a step.
pub async fn get_step_result(
    pool: &DbPool,
    execution_id: i64,
    node_name: &str,
) -> AppResult<Option<serde_json::Value>> {
    let row: Option<(Option<serde_json::Value>,)> = sqlx::query_as(
        r#"
        SELECT result
        FROM noetl.event
        WHERE execution_id = $1
          AND node_name = $2
          AND event_type IN ('action_completed', 'iterator_completed')
        ORDER BY event_id DESC
        LIMIT 1
        "#,
    )
    .bind(execution_id)
    .bind(node_name)
    .fetch_optional(pool)
    .await?;

    Ok(row.and_then(|(r,)| r))
}

/// Latest result per step name for an execution, used to build the broker's
/// transition evaluation context (`{ <step_name>: <step_result>, ... }`).
pub async fn get_all_step_results(
    pool: &DbPool,
    execution_id: i64,
) -> AppResult<Vec<(String, serde_json::Value)>> {
    let rows: Vec<(Option<String>, Option<serde_json::Value>)> = sqlx::query_as(
        r#"
        SELECT DISTINCT ON (node_name) node_name, result
        FROM noetl.event
        WHERE execution_id = $1
          AND event_type IN ('action_completed', 'iterator_completed')
          AND result IS NOT NULL
        ORDER BY node_name, event_id DESC
        "#,
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(name, result)| name.zip(result))
        .collect())
}

/// Step names that have `action_completed`/`iterator_completed` but no
/// `step_completed` yet — the broker's `process_completed_steps` work list.
pub async fn get_steps_pending_completion(
    pool: &DbPool,
    execution_id: i64,
) -> AppResult<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT DISTINCT done.node_name
        FROM noetl.event done
        WHERE done.execution_id = $1
          AND done.event_type IN ('action_completed', 'iterator_completed')
          AND done.node_name IS NOT NULL
          AND NOT EXISTS (
              SELECT 1 FROM noetl.event sc
              WHERE sc.execution_id = done.execution_id
                AND sc.node_name = done.node_name
                AND sc.event_type = 'step_completed'
          )
        "#,
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(n,)| n).collect())
}

/// Check if an event type exists for an execution.
pub async fn has_event_type(pool: &DbPool, execution_id: i64, event_type: &str) -> AppResult<bool> {
    let row: Option<(i32,)> = sqlx::query_as(
        "SELECT 1 FROM noetl.event WHERE execution_id = $1 AND event_type = $2 LIMIT 1",
    )
    .bind(execution_id)
    .bind(event_type)
    .fetch_optional(pool)
    .await?;

    Ok(row.is_some())
}

/// Classify execution state per SPEC_FULL.md §4.5: initial / in_progress / completed.
pub async fn classify_execution(pool: &DbPool, execution_id: i64) -> AppResult<ExecutionClass> {
    if has_event_type(pool, execution_id, &EventType::ExecutionFailed.to_string()).await?
        || has_event_type(pool, execution_id, &EventType::ExecutionCompleted.to_string()).await?
    {
        return Ok(ExecutionClass::Completed);
    }
    if has_event_type(pool, execution_id, &EventType::StepStarted.to_string()).await? {
        return Ok(ExecutionClass::InProgress);
    }
    Ok(ExecutionClass::Initial)
}

/// Broker state classification for an execution (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionClass {
    Initial,
    InProgress,
    Completed,
}

/// Count events for an execution.
pub async fn count_events(
    pool: &DbPool,
    execution_id: i64,
    event_type: Option<&str>,
) -> AppResult<i64> {
    let count: (i64,) = if let Some(et) = event_type {
        sqlx::query_as("SELECT COUNT(*) FROM noetl.event WHERE execution_id = $1 AND event_type = $2")
            .bind(execution_id)
            .bind(et)
            .fetch_one(pool)
            .await?
    } else {
        sqlx::query_as("SELECT COUNT(*) FROM noetl.event WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_one(pool)
            .await?
    };

    Ok(count.0)
}

/// Get events created since a specific timestamp.
pub async fn get_events_since(
    pool: &DbPool,
    execution_id: i64,
    since: DateTime<Utc>,
) -> AppResult<Vec<Event>> {
    let query =
        format!("SELECT {EVENT_COLUMNS} FROM noetl.event WHERE execution_id = $1 AND created_at > $2 ORDER BY event_id ASC");
    let events = sqlx::query_as::<_, Event>(&query)
        .bind(execution_id)
        .bind(since)
        .fetch_all(pool)
        .await?;

    Ok(events)
}

/// Get the `execution_started` event to recover catalog_id / workload / lineage.
pub async fn get_execution_started_event(
    pool: &DbPool,
    execution_id: i64,
) -> AppResult<Option<Event>> {
    get_latest_event(pool, execution_id, Some("execution_started")).await
}

/// Find the child execution spawned from a given parent event (used by the
/// iterator controller's mode B: each `iteration_started` event on the parent
/// is the `parent_event_id` of the matching child's `execution_started`).
pub async fn get_child_execution_started(
    pool: &DbPool,
    parent_event_id: i64,
) -> AppResult<Option<Event>> {
    let query = format!(
        "SELECT {EVENT_COLUMNS} FROM noetl.event WHERE parent_event_id = $1 AND event_type = 'execution_started' LIMIT 1"
    );
    let event = sqlx::query_as::<_, Event>(&query)
        .bind(parent_event_id)
        .fetch_optional(pool)
        .await?;

    Ok(event)
}

/// Get the terminal event (`execution_completed` or `execution_failed`) for
/// an execution, if it has reached one.
pub async fn get_execution_terminal_event(
    pool: &DbPool,
    execution_id: i64,
) -> AppResult<Option<Event>> {
    let query = format!(
        "SELECT {EVENT_COLUMNS} FROM noetl.event WHERE execution_id = $1 AND event_type IN ('execution_completed', 'execution_failed') ORDER BY event_id DESC LIMIT 1"
    );
    let event = sqlx::query_as::<_, Event>(&query)
        .bind(execution_id)
        .fetch_optional(pool)
        .await?;

    Ok(event)
}
