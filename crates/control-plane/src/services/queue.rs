//! Queue service (C2, SPEC_FULL.md §4.2).
//!
//! Thin wrapper over `db::queries::queue` that adds Snowflake ID generation
//! for new entries and the periodic redelivery sweep. Workers never talk to
//! Postgres directly — this service, via the HTTP queue API, is their only
//! way in.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::models::QueueEntry;
use crate::db::queries::queue::{self as queries, NewQueueEntry};
use crate::db::snowflake;
use crate::db::DbPool;
use crate::error::AppResult;
use crate::nats::NatsPublisher;

/// Default lease duration for a leased job, renewed by worker heartbeats.
pub const DEFAULT_LEASE_SECS: i64 = 60;

/// Default max attempts for a queue entry absent an explicit retry policy.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 1;

/// Outcome of a lease attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseResponse {
    pub entry: Option<QueueEntry>,
}

/// Outcome of a heartbeat: `true` means the lease is still held.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ok: bool,
}

#[derive(Debug, Clone)]
pub struct QueueService {
    pool: DbPool,
    nats: Option<Arc<NatsPublisher>>,
}

impl QueueService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool, nats: None }
    }

    /// Attach a NATS publisher so `enqueue` also fires a wake-up hint.
    pub fn with_nats(pool: DbPool, nats: Option<NatsPublisher>) -> Self {
        Self {
            pool,
            nats: nats.map(Arc::new),
        }
    }

    /// `enqueue`: generates a queue_id and inserts, `ON CONFLICT DO NOTHING`
    /// on `(execution_id, node_id)` so a re-evaluated broker never double
    /// enqueues the same node (invariant 4, SPEC_FULL.md §3.2).
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue(
        &self,
        execution_id: i64,
        catalog_id: i64,
        node_id: &str,
        node_name: &str,
        action: &str,
        context: &serde_json::Value,
        meta: &serde_json::Value,
        priority: i32,
        available_at: chrono::DateTime<chrono::Utc>,
        max_attempts: i32,
    ) -> AppResult<i64> {
        let queue_id = snowflake::generate(&self.pool).await?;
        let entry = NewQueueEntry {
            queue_id,
            execution_id,
            catalog_id,
            node_id,
            node_name,
            action,
            context,
            meta,
            priority,
            max_attempts,
            available_at,
        };
        let queue_id = queries::enqueue(&self.pool, &entry).await?;

        if let Some(nats) = self.nats.clone() {
            let node_name = node_name.to_string();
            tokio::spawn(async move {
                if let Err(e) = nats.publish(execution_id, &node_name).await {
                    tracing::warn!(execution_id, error = %e, "failed to publish enqueue notification");
                }
            });
        }

        Ok(queue_id)
    }

    /// `lease`: atomically claim the oldest available job matching `action`.
    pub async fn lease(
        &self,
        worker_id: &str,
        lease_duration_secs: i64,
        action_filter: Option<&str>,
    ) -> AppResult<Option<QueueEntry>> {
        queries::lease(&self.pool, worker_id, lease_duration_secs, action_filter).await
    }

    /// `heartbeat`: extend an active lease. Returns `false` if the lease was
    /// stolen (expired and swept, or reassigned to another worker).
    pub async fn heartbeat(
        &self,
        queue_id: i64,
        worker_id: &str,
        lease_duration_secs: i64,
    ) -> AppResult<bool> {
        queries::heartbeat(&self.pool, queue_id, worker_id, lease_duration_secs).await
    }

    /// `complete`: mark the job done.
    pub async fn complete(&self, queue_id: i64, worker_id: &str) -> AppResult<Option<QueueEntry>> {
        queries::complete(&self.pool, queue_id, worker_id).await
    }

    /// `fail`: requeue (with exponential-ish backoff supplied by the caller)
    /// or mark dead.
    pub async fn fail(
        &self,
        queue_id: i64,
        worker_id: &str,
        retry_allowed: bool,
        available_at: chrono::DateTime<chrono::Utc>,
    ) -> AppResult<Option<QueueEntry>> {
        queries::fail(&self.pool, queue_id, worker_id, retry_allowed, available_at).await
    }

    /// Requeue a job with a server-computed `available_at`, overriding the
    /// row's own attempt bookkeeping. Used by the retry evaluator once it has
    /// already decided (against the step's retry policy) that another
    /// attempt is warranted.
    pub async fn reschedule(
        &self,
        queue_id: i64,
        available_at: chrono::DateTime<chrono::Utc>,
    ) -> AppResult<Option<QueueEntry>> {
        queries::reschedule(&self.pool, queue_id, available_at).await
    }

    /// Mark a job terminally dead, overriding the row's own attempt
    /// bookkeeping. Used once the retry evaluator has exhausted all policies.
    pub async fn mark_dead(&self, queue_id: i64) -> AppResult<Option<QueueEntry>> {
        queries::mark_dead(&self.pool, queue_id).await
    }

    pub async fn get_by_id(&self, queue_id: i64) -> AppResult<Option<QueueEntry>> {
        queries::get_by_id(&self.pool, queue_id).await
    }

    pub async fn get_by_node_id(
        &self,
        execution_id: i64,
        node_id: &str,
    ) -> AppResult<Option<QueueEntry>> {
        queries::get_by_node_id(&self.pool, execution_id, node_id).await
    }

    pub async fn count_by_status(&self, execution_id: i64, status: &str) -> AppResult<i64> {
        queries::count_by_status(&self.pool, execution_id, status).await
    }

    /// Run the redelivery sweep once.
    pub async fn sweep_once(&self) -> AppResult<u64> {
        queries::sweep_expired_leases(&self.pool).await
    }

    /// Spawn the periodic redelivery sweep as a background task. Entries
    /// whose lease silently expired (worker crashed, network partition) are
    /// returned to `queued` so another worker can pick them up.
    pub fn spawn_sweep(self, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match self.sweep_once().await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(requeued = n, "redelivery sweep requeued expired leases"),
                    Err(err) => tracing::warn!(error = %err, "redelivery sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_constants() {
        assert_eq!(DEFAULT_LEASE_SECS, 60);
        assert_eq!(DEFAULT_MAX_ATTEMPTS, 1);
    }
}
