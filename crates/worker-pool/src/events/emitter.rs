//! Event emitter with retry logic.
//!
//! A worker reports exactly three event types per job: `action_started`
//! before dispatch, then `action_completed` or `action_error` after (§4.8).

use anyhow::Result;
use std::time::Duration;

use crate::client::{ControlPlaneClient, WorkerEvent};

/// Event emitter with automatic retry.
pub struct EventEmitter {
    client: ControlPlaneClient,
    worker_id: String,
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl EventEmitter {
    /// Create a new event emitter.
    pub fn new(client: ControlPlaneClient, worker_id: String) -> Self {
        Self {
            client,
            worker_id,
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }

    async fn emit(&self, event: WorkerEvent) -> Result<()> {
        let mut delay = self.initial_delay;

        for attempt in 0..=self.max_retries {
            match self.client.emit_event(event.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        error = %e,
                        event_type = %event.event_type,
                        "Event emission failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.max_delay);
                }
                Err(e) => {
                    tracing::error!(
                        event_type = %event.event_type,
                        error = %e,
                        "Event emission failed after all retries"
                    );
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Emit `action_started` before dispatching a job's primary task.
    pub async fn action_started(&self, execution_id: i64, node_name: &str, attempt: i32) -> Result<()> {
        self.emit(WorkerEvent {
            execution_id,
            node_name: node_name.to_string(),
            event_type: "action_started".to_string(),
            result: None,
            worker_id: Some(self.worker_id.clone()),
            attempt: Some(attempt),
        })
        .await
    }

    /// Emit `action_completed` with the task's result envelope.
    pub async fn action_completed(
        &self,
        execution_id: i64,
        node_name: &str,
        attempt: i32,
        result: serde_json::Value,
    ) -> Result<()> {
        self.emit(WorkerEvent {
            execution_id,
            node_name: node_name.to_string(),
            event_type: "action_completed".to_string(),
            result: Some(result),
            worker_id: Some(self.worker_id.clone()),
            attempt: Some(attempt),
        })
        .await
    }

    /// Emit `action_error` with the task's error envelope.
    pub async fn action_error(
        &self,
        execution_id: i64,
        node_name: &str,
        attempt: i32,
        result: serde_json::Value,
    ) -> Result<()> {
        self.emit(WorkerEvent {
            execution_id,
            node_name: node_name.to_string(),
            event_type: "action_error".to_string(),
            result: Some(result),
            worker_id: Some(self.worker_id.clone()),
            attempt: Some(attempt),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_emitter_creation() {
        let client = ControlPlaneClient::new("http://localhost:8082");
        let emitter = EventEmitter::new(client, "worker-1".to_string());

        assert_eq!(emitter.max_retries, 3);
        assert_eq!(emitter.worker_id, "worker-1");
    }
}
