//! NATS JetStream wake-up hint.
//!
//! The queue's `lease`/heartbeat/complete/fail HTTP contract is the sole
//! authority on job state (§4.8); this subscriber exists only to cut polling
//! latency. It carries no job payload — a worker that receives a
//! notification still leases through the ordinary HTTP call, which is the
//! only source of a job's rendered context.

use anyhow::Result;
use async_nats::jetstream::{self, consumer::pull::Config as ConsumerConfig, Context};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

/// Enqueue notification received from NATS. Informational only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueNotification {
    pub execution_id: i64,
    pub node_name: String,
}

pub struct NatsSubscriber {
    js: Context,
    stream: String,
    consumer: String,
    subject: String,
}

impl NatsSubscriber {
    /// Connect to NATS and create a subscriber.
    pub async fn connect(nats_url: &str, stream: &str, consumer: &str) -> Result<Self> {
        let client = async_nats::connect(nats_url).await?;
        let js = jetstream::new(client);

        let stream_config = jetstream::stream::Config {
            name: stream.to_string(),
            subjects: vec!["noetl.queue.enqueued".to_string()],
            ..Default::default()
        };

        match js.get_stream(stream).await {
            Ok(_) => {
                tracing::debug!(stream = %stream, "Using existing NATS stream");
            }
            Err(_) => {
                js.create_stream(stream_config).await?;
                tracing::info!(stream = %stream, "Created NATS stream");
            }
        }

        Ok(Self {
            js,
            stream: stream.to_string(),
            consumer: consumer.to_string(),
            subject: "noetl.queue.enqueued".to_string(),
        })
    }

    async fn ensure_consumer(&self) -> Result<jetstream::consumer::Consumer<jetstream::consumer::pull::Config>> {
        let stream = self.js.get_stream(&self.stream).await?;

        let consumer_config = ConsumerConfig {
            durable_name: Some(self.consumer.clone()),
            filter_subject: self.subject.clone(),
            ..Default::default()
        };

        match stream.get_consumer(&self.consumer).await {
            Ok(consumer) => Ok(consumer),
            Err(_) => {
                let consumer = stream.create_consumer(consumer_config).await?;
                tracing::info!(consumer = %self.consumer, "Created NATS consumer");
                Ok(consumer)
            }
        }
    }

    /// Wait for the next enqueue notification, acking it immediately —
    /// there is nothing to redeliver since the lease call is authoritative.
    pub async fn receive(&self) -> Result<Option<EnqueueNotification>> {
        let consumer = self.ensure_consumer().await?;
        let mut messages = consumer.fetch().max_messages(1).messages().await?;

        if let Some(msg) = messages.next().await {
            let msg = msg.map_err(|e| anyhow::anyhow!("Failed to receive message: {}", e))?;
            let notification: EnqueueNotification = serde_json::from_slice(&msg.payload)?;
            msg.ack()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to ack message: {}", e))?;
            return Ok(Some(notification));
        }

        Ok(None)
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

        let parsed: EnqueueNotification = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.execution_id, 12345);
    }
}
