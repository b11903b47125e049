//! Queue database queries (C2, SPEC_FULL.md §4.2).
//!
//! `lease` uses `FOR UPDATE SKIP LOCKED` so concurrent workers never block on
//! each other; `enqueue` relies on `ON CONFLICT(execution_id, node_id) DO
//! NOTHING` for invariant 4 (queue uniqueness, SPEC_FULL.md §3.2).

use chrono::{DateTime, Utc};

use crate::db::models::QueueEntry;
use crate::db::DbPool;
use crate::error::AppResult;

const QUEUE_COLUMNS: &str = r#"
    queue_id, execution_id, catalog_id, node_id, node_name, action,
    context, meta, priority, status, attempts, max_attempts,
    available_at, lease_until, last_heartbeat, worker_id, created_at
"#;

/// Fields needed to enqueue a new job.
#[derive(Debug, Clone)]
pub struct NewQueueEntry<'a> {
    pub queue_id: i64,
    pub execution_id: i64,
    pub catalog_id: i64,
    pub node_id: &'a str,
    pub node_name: &'a str,
    pub action: &'a str,
    pub context: &'a serde_json::Value,
    pub meta: &'a serde_json::Value,
    pub priority: i32,
    pub max_attempts: i32,
    pub available_at: DateTime<Utc>,
}

/// `enqueue`: `ON CONFLICT(execution_id, node_id) DO NOTHING`, returning the
/// existing queue_id on conflict.
pub async fn enqueue(pool: &DbPool, e: &NewQueueEntry<'_>) -> AppResult<i64> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO noetl.queue (
            queue_id, execution_id, catalog_id, node_id, node_name, action,
            context, meta, priority, status, attempts, max_attempts,
            available_at, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'queued', 0, $10, $11, $12)
        ON CONFLICT (execution_id, node_id) DO NOTHING
        RETURNING queue_id
        "#,
    )
    .bind(e.queue_id)
    .bind(e.execution_id)
    .bind(e.catalog_id)
    .bind(e.node_id)
    .bind(e.node_name)
    .bind(e.action)
    .bind(e.context)
    .bind(e.meta)
    .bind(e.priority)
    .bind(e.max_attempts)
    .bind(e.available_at)
    .bind(Utc::now())
    .fetch_optional(pool)
    .await?;

    match row {
        Some((id,)) => Ok(id),
        None => {
            let existing: (i64,) = sqlx::query_as(
                "SELECT queue_id FROM noetl.queue WHERE execution_id = $1 AND node_id = $2",
            )
            .bind(e.execution_id)
            .bind(e.node_id)
            .fetch_one(pool)
            .await?;
            Ok(existing.0)
        }
    }
}

/// `lease`: atomically claim the oldest available `queued` row.
pub async fn lease(
    pool: &DbPool,
    worker_id: &str,
    lease_duration_secs: i64,
    action_filter: Option<&str>,
) -> AppResult<Option<QueueEntry>> {
    let query = format!(
        r#"
        UPDATE noetl.queue
        SET status = 'leased',
            worker_id = $1,
            attempts = attempts + 1,
            lease_until = now() + make_interval(secs => $2),
            last_heartbeat = now()
        WHERE queue_id = (
            SELECT queue_id FROM noetl.queue
            WHERE status = 'queued'
              AND available_at <= now()
              AND ($3::text IS NULL OR action = $3)
            ORDER BY priority DESC, queue_id ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        RETURNING {QUEUE_COLUMNS}
        "#
    );

    let entry = sqlx::query_as::<_, QueueEntry>(&query)
        .bind(worker_id)
        .bind(lease_duration_secs)
        .bind(action_filter)
        .fetch_optional(pool)
        .await?;

    Ok(entry)
}

/// `heartbeat`: extend the lease. Fails silently (returns `false`) if
/// `worker_id` no longer matches the current lessee — the caller must treat
/// that as a stolen lease and stop work.
pub async fn heartbeat(
    pool: &DbPool,
    queue_id: i64,
    worker_id: &str,
    lease_duration_secs: i64,
) -> AppResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE noetl.queue
        SET lease_until = now() + make_interval(secs => $3),
            last_heartbeat = now()
        WHERE queue_id = $1 AND worker_id = $2 AND status = 'leased'
        "#,
    )
    .bind(queue_id)
    .bind(worker_id)
    .bind(lease_duration_secs)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// `complete`: mark the entry `done`. Returns the execution/parent ids so the
/// caller can trigger broker re-evaluation.
pub async fn complete(
    pool: &DbPool,
    queue_id: i64,
    worker_id: &str,
) -> AppResult<Option<QueueEntry>> {
    let query = format!(
        r#"
        UPDATE noetl.queue
        SET status = 'done'
        WHERE queue_id = $1 AND worker_id = $2 AND status = 'leased'
        RETURNING {QUEUE_COLUMNS}
        "#
    );

    let entry = sqlx::query_as::<_, QueueEntry>(&query)
        .bind(queue_id)
        .bind(worker_id)
        .fetch_optional(pool)
        .await?;

    Ok(entry)
}

/// `fail`: requeue with computed `available_at` if retryable and attempts
/// remain, otherwise mark `dead`.
pub async fn fail(
    pool: &DbPool,
    queue_id: i64,
    worker_id: &str,
    retry_allowed: bool,
    available_at: DateTime<Utc>,
) -> AppResult<Option<QueueEntry>> {
    let query = if retry_allowed {
        format!(
            r#"
            UPDATE noetl.queue
            SET status = CASE WHEN attempts < max_attempts THEN 'queued' ELSE 'dead' END,
                available_at = CASE WHEN attempts < max_attempts THEN $3 ELSE available_at END,
                worker_id = CASE WHEN attempts < max_attempts THEN NULL ELSE worker_id END,
                lease_until = NULL
            WHERE queue_id = $1 AND worker_id = $2 AND status = 'leased'
            RETURNING {QUEUE_COLUMNS}
            "#
        )
    } else {
        format!(
            r#"
            UPDATE noetl.queue
            SET status = 'dead', lease_until = NULL
            WHERE queue_id = $1 AND worker_id = $2 AND status = 'leased'
            RETURNING {QUEUE_COLUMNS}
            "#
        )
    };

    let entry = sqlx::query_as::<_, QueueEntry>(&query)
        .bind(queue_id)
        .bind(worker_id)
        .bind(available_at)
        .fetch_optional(pool)
        .await?;

    Ok(entry)
}

/// Unconditionally requeue a leased entry with a caller-computed
/// `available_at`, bypassing the row's own `attempts`/`max_attempts`
/// comparison. Used by the retry evaluator, which has already decided the
/// outcome against the step's retry policy rather than the queue's own
/// bookkeeping.
pub async fn reschedule(
    pool: &DbPool,
    queue_id: i64,
    available_at: DateTime<Utc>,
) -> AppResult<Option<QueueEntry>> {
    let query = format!(
        r#"
        UPDATE noetl.queue
        SET status = 'queued', worker_id = NULL, lease_until = NULL, available_at = $2
        WHERE queue_id = $1
        RETURNING {QUEUE_COLUMNS}
        "#
    );

    let entry = sqlx::query_as::<_, QueueEntry>(&query)
        .bind(queue_id)
        .bind(available_at)
        .fetch_optional(pool)
        .await?;

    Ok(entry)
}

/// Unconditionally mark an entry `dead`. See `reschedule` for why this
/// bypasses the row's own attempt counter.
pub async fn mark_dead(pool: &DbPool, queue_id: i64) -> AppResult<Option<QueueEntry>> {
    let query = format!(
        r#"
        UPDATE noetl.queue
        SET status = 'dead', lease_until = NULL
        WHERE queue_id = $1
        RETURNING {QUEUE_COLUMNS}
        "#
    );

    let entry = sqlx::query_as::<_, QueueEntry>(&query)
        .bind(queue_id)
        .fetch_optional(pool)
        .await?;

    Ok(entry)
}

/// Redelivery sweep: requeue entries whose lease has silently expired.
/// Returns the number of entries requeued.
pub async fn sweep_expired_leases(pool: &DbPool) -> AppResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE noetl.queue
        SET status = 'queued', worker_id = NULL, lease_until = NULL
        WHERE status = 'leased' AND lease_until < now()
        "#,
    )
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn get_by_id(pool: &DbPool, queue_id: i64) -> AppResult<Option<QueueEntry>> {
    let query = format!("SELECT {QUEUE_COLUMNS} FROM noetl.queue WHERE queue_id = $1");
    let entry = sqlx::query_as::<_, QueueEntry>(&query)
        .bind(queue_id)
        .fetch_optional(pool)
        .await?;
    Ok(entry)
}

pub async fn get_by_node_id(
    pool: &DbPool,
    execution_id: i64,
    node_id: &str,
) -> AppResult<Option<QueueEntry>> {
    let query =
        format!("SELECT {QUEUE_COLUMNS} FROM noetl.queue WHERE execution_id = $1 AND node_id = $2");
    let entry = sqlx::query_as::<_, QueueEntry>(&query)
        .bind(execution_id)
        .bind(node_id)
        .fetch_optional(pool)
        .await?;
    Ok(entry)
}

/// Count queue entries for an execution grouped loosely by status, used for
/// the iterator controller's child-completion check (mode B).
pub async fn count_by_status(
    pool: &DbPool,
    execution_id: i64,
    status: &str,
) -> AppResult<i64> {
    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM noetl.queue WHERE execution_id = $1 AND status = $2",
    )
    .bind(execution_id)
    .bind(status)
    .fetch_one(pool)
    .await?;
    Ok(count.0)
}
