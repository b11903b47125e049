//! Worker lifecycle: registration, the lease loop, and per-job heartbeats.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::client::{ControlPlaneClient, QueueEntry};
use crate::config::WorkerConfig;
use crate::events::EventEmitter;
use crate::executor::TaskExecutor;
use crate::nats::NatsSubscriber;

/// A worker that leases jobs from the control plane's queue and executes
/// them. NATS, when configured, only shortens the gap between a job being
/// enqueued and the next `lease` poll — it is never load-bearing.
pub struct Worker {
    config: WorkerConfig,
    client: ControlPlaneClient,
    executor: Arc<TaskExecutor>,
    events: Arc<EventEmitter>,
    subscriber: Option<NatsSubscriber>,
}

impl Worker {
    /// Create a new worker.
    pub async fn new(config: WorkerConfig) -> Result<Self> {
        let client = ControlPlaneClient::new(&config.server_url);
        let executor = Arc::new(TaskExecutor::new(client.clone(), config.worker_id.clone()));
        let events = Arc::new(EventEmitter::new(client.clone(), config.worker_id.clone()));

        let subscriber = match &config.nats_url {
            Some(url) => match NatsSubscriber::connect(url, &config.nats_stream, &config.nats_consumer).await {
                Ok(sub) => Some(sub),
                Err(e) => {
                    tracing::warn!(error = %e, "NATS unavailable, falling back to plain polling");
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            config,
            client,
            executor,
            events,
            subscriber,
        })
    }

    /// Run the worker until the process loop returns an error.
    pub async fn run(&self) -> Result<()> {
        self.register().await?;
        let pool_heartbeat = self.start_pool_heartbeat();

        let result = self.process_loop().await;

        pool_heartbeat.abort();
        self.deregister().await?;

        result
    }

    async fn register(&self) -> Result<()> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        self.client
            .register_worker(&self.config.worker_id, &self.config.pool_name, &hostname)
            .await?;

        tracing::info!(
            worker_id = %self.config.worker_id,
            pool_name = %self.config.pool_name,
            hostname = %hostname,
            "Worker registered"
        );

        Ok(())
    }

    async fn deregister(&self) -> Result<()> {
        self.client.deregister_worker(&self.config.pool_name).await?;
        tracing::info!(worker_id = %self.config.worker_id, "Worker deregistered");
        Ok(())
    }

    fn start_pool_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let pool_name = self.config.pool_name.clone();
        let interval = self.config.pool_heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if let Err(e) = client.heartbeat_pool(&pool_name).await {
                    tracing::warn!(error = %e, "Pool heartbeat failed");
                }
            }
        })
    }

    /// Lease, run, report — one iteration per loop pass (§4.8).
    async fn process_loop(&self) -> Result<()> {
        loop {
            let leased = self
                .client
                .lease(
                    &self.config.worker_id,
                    self.config.lease_duration_secs,
                    self.config.action_filter.as_deref(),
                )
                .await?;

            match leased {
                Some(job) => self.run_job(job).await,
                None => self.wait_for_work().await,
            }
        }
    }

    /// Block briefly for a NATS wake-up hint, falling back to a plain sleep
    /// when NATS is unavailable or silent.
    async fn wait_for_work(&self) {
        if let Some(subscriber) = &self.subscriber {
            match tokio::time::timeout(self.config.poll_interval, subscriber.receive()).await {
                Ok(Ok(Some(_))) => {}
                Ok(Ok(None)) => tokio::time::sleep(self.config.poll_interval).await,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "NATS receive failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(_) => {}
            }
        } else {
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn run_job(&self, job: QueueEntry) {
        let queue_id = job.queue_id;
        let execution_id = job.execution_id;
        let node_name = job.node_name.clone();
        let attempt = job.attempts;

        if let Err(e) = self.events.action_started(execution_id, &node_name, attempt).await {
            tracing::warn!(error = %e, "Failed to emit action_started");
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let heartbeat = self.spawn_job_heartbeat(queue_id, cancelled.clone());

        let outcome = self.executor.execute(&job).await;
        heartbeat.abort();

        if cancelled.load(Ordering::SeqCst) {
            tracing::warn!(queue_id, "Lease lost mid-execution, abandoning report");
            return;
        }

        match outcome {
            Ok(envelope) => {
                let success = envelope.get("status").and_then(|v| v.as_str()) == Some("success");
                let emit_result = if success {
                    self.events
                        .action_completed(execution_id, &node_name, attempt, envelope.clone())
                        .await
                } else {
                    self.events
                        .action_error(execution_id, &node_name, attempt, envelope.clone())
                        .await
                };
                if let Err(e) = emit_result {
                    tracing::warn!(error = %e, "Failed to emit task outcome event");
                }

                let report = if success {
                    self.client.complete(queue_id, &self.config.worker_id).await
                } else {
                    self.client
                        .fail(queue_id, &self.config.worker_id, true, None)
                        .await
                };
                if let Err(e) = report {
                    tracing::error!(queue_id, error = %e, "Failed to report job outcome to queue");
                }
            }
            Err(e) => {
                tracing::error!(queue_id, error = %e, "Job dispatch failed");
                let error_envelope = serde_json::json!({"status": "error", "error": e.to_string()});
                if let Err(e) = self
                    .events
                    .action_error(execution_id, &node_name, attempt, error_envelope)
                    .await
                {
                    tracing::warn!(error = %e, "Failed to emit action_error");
                }
                if let Err(e) = self
                    .client
                    .fail(queue_id, &self.config.worker_id, true, None)
                    .await
                {
                    tracing::error!(queue_id, error = %e, "Failed to report job failure to queue");
                }
            }
        }
    }

    /// Renew the lease at roughly a third of its duration; flips `cancelled`
    /// and stops once the server reports the lease is no longer ours.
    fn spawn_job_heartbeat(&self, queue_id: i64, cancelled: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let worker_id = self.config.worker_id.clone();
        let lease_secs = self.config.lease_duration_secs;
        let tick = Duration::from_secs((lease_secs / 3).max(1) as u64);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match client.heartbeat(queue_id, &worker_id, lease_secs).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(queue_id, "Lease heartbeat rejected, lease lost");
                        cancelled.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(queue_id, error = %e, "Lease heartbeat request failed");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config() {
        let config = WorkerConfig::default();
        assert!(!config.worker_id.is_empty());
        assert_eq!(config.pool_name, "default");
    }
}
