//! Worker configuration.

use anyhow::Result;
use std::time::Duration;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier (UUID).
    pub worker_id: String,

    /// Worker pool name, registered with the control plane as a runtime.
    pub pool_name: String,

    /// Control plane server URL.
    pub server_url: String,

    /// NATS server URL used for the wake-up hint. `None` disables NATS
    /// entirely and falls back to plain polling at `poll_interval`.
    pub nats_url: Option<String>,

    /// NATS stream name for enqueue notifications.
    pub nats_stream: String,

    /// NATS consumer name.
    pub nats_consumer: String,

    /// Lease duration requested on `lease`/`heartbeat` calls. The worker
    /// renews the lease at roughly a third of this interval.
    pub lease_duration_secs: i64,

    /// How long to sleep between `lease` polls when neither a job nor a
    /// NATS notification is available.
    pub poll_interval: Duration,

    /// How often to refresh the worker pool's own runtime heartbeat row.
    pub pool_heartbeat_interval: Duration,

    /// Action filter passed to `lease`; `None` means "any registered tool".
    pub action_filter: Option<String>,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let worker_id =
            std::env::var("WORKER_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let pool_name = std::env::var("WORKER_POOL_NAME").unwrap_or_else(|_| "default".to_string());

        let server_url =
            std::env::var("NOETL_SERVER_URL").unwrap_or_else(|_| "http://localhost:8082".to_string());

        let nats_url = std::env::var("NATS_URL").ok().filter(|s| !s.is_empty());

        let nats_stream = std::env::var("NATS_STREAM").unwrap_or_else(|_| "noetl_queue".to_string());

        let nats_consumer = std::env::var("NATS_CONSUMER").unwrap_or_else(|_| "worker-pool".to_string());

        let lease_duration_secs: i64 = std::env::var("WORKER_LEASE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let poll_secs: u64 = std::env::var("WORKER_POLL_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2);

        let pool_heartbeat_secs: u64 = std::env::var("WORKER_POOL_HEARTBEAT_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(15);

        let action_filter = std::env::var("WORKER_ACTION_FILTER").ok().filter(|s| !s.is_empty());

        Ok(Self {
            worker_id,
            pool_name,
            server_url,
            nats_url,
            nats_stream,
            nats_consumer,
            lease_duration_secs,
            poll_interval: Duration::from_secs(poll_secs),
            pool_heartbeat_interval: Duration::from_secs(pool_heartbeat_secs),
            action_filter,
        })
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            pool_name: "default".to_string(),
            server_url: "http://localhost:8082".to_string(),
            nats_url: None,
            nats_stream: "noetl_queue".to_string(),
            nats_consumer: "worker-pool".to_string(),
            lease_duration_secs: 60,
            poll_interval: Duration::from_secs(2),
            pool_heartbeat_interval: Duration::from_secs(15),
            action_filter: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.pool_name, "default");
        assert_eq!(config.lease_duration_secs, 60);
        assert!(config.nats_url.is_none());
    }
}
