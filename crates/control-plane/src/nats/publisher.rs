//! NATS enqueue notification publisher.
//!
//! Purely a latency optimization: the queue's lease/heartbeat/complete/fail
//! HTTP contract is the sole authority on job state. A worker that misses a
//! notification, or runs with no NATS at all, still picks the job up on its
//! next poll — nothing here carries the job's rendered context.

use async_nats::jetstream::{self, Context};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Default NATS subject for enqueue notifications.
pub const DEFAULT_SUBJECT: &str = "noetl.queue.enqueued";

/// Default JetStream stream name.
pub const DEFAULT_STREAM: &str = "noetl_queue";

/// Errors that can occur during NATS operations.
#[derive(Debug, Error)]
pub enum NatsError {
    #[error("NATS connection error: {0}")]
    Connection(String),

    #[error("JetStream error: {0}")]
    JetStream(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Not connected to NATS")]
    NotConnected,
}

/// Enqueue notification published to NATS. Informational only — a worker
/// that receives it still leases through the ordinary HTTP call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueNotification {
    pub execution_id: i64,
    pub node_name: String,
}

/// NATS JetStream publisher for enqueue notifications.
///
/// Optional component — the queue works without NATS in plain polling mode.
#[derive(Clone)]
pub struct NatsPublisher {
    js: Context,
    subject: String,
}

impl std::fmt::Debug for NatsPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsPublisher").field("subject", &self.subject).finish()
    }
}

impl NatsPublisher {
    /// Create a new publisher from an existing client, ensuring the stream
    /// it publishes to exists.
    pub async fn new(
        client: Arc<async_nats::Client>,
        subject: Option<&str>,
        stream_name: Option<&str>,
    ) -> Result<Self, NatsError> {
        let subject = subject.unwrap_or(DEFAULT_SUBJECT).to_string();
        let stream = stream_name.unwrap_or(DEFAULT_STREAM);

        let js = jetstream::new((*client).clone());
        Self::ensure_stream(&js, stream, &subject).await?;

        Ok(Self { js, subject })
    }

    async fn ensure_stream(js: &Context, stream: &str, subject: &str) -> Result<(), NatsError> {
        match js.get_stream(stream).await {
            Ok(_) => {
                tracing::debug!(stream = %stream, "Using existing NATS stream");
                Ok(())
            }
            Err(_) => {
                let config = jetstream::stream::Config {
                    name: stream.to_string(),
                    subjects: vec![subject.to_string()],
                    max_age: std::time::Duration::from_secs(3600),
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                };

                js.create_stream(config)
                    .await
                    .map_err(|e| NatsError::JetStream(e.to_string()))?;

                tracing::info!(stream = %stream, subject = %subject, "Created NATS stream");
                Ok(())
            }
        }
    }

    /// Publish a wake-up hint for a newly enqueued job. Best-effort — the
    /// caller should log and move on rather than fail the enqueue on error.
    pub async fn publish(&self, execution_id: i64, node_name: &str) -> Result<(), NatsError> {
        let notification = EnqueueNotification {
            execution_id,
            node_name: node_name.to_string(),
        };
        let payload = serde_json::to_vec(&notification)
            .map_err(|e| NatsError::Publish(format!("Serialization error: {}", e)))?;

        self.js
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?;

        tracing::debug!(execution_id, node_name, "Published enqueue notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_notification_serialization() {
        let notification = EnqueueNotification {
            execution_id: 12345,
            node_name: "process_data".to_string(),
        };

        let json = serde_json::to_string(&notification).unwrap();
        assert!(json.contains("12345"));
        assert!(json.contains("process_data"));
    }

    #[test]
    fn test_default_constants() {
        assert_eq!(DEFAULT_SUBJECT, "noetl.queue.enqueued");
        assert_eq!(DEFAULT_STREAM, "noetl_queue");
    }
}
