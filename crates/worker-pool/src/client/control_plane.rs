//! Control plane HTTP client.
//!
//! Workers never touch Postgres; every state transition — lease, heartbeat,
//! complete, fail — goes through the control plane's queue API, and every
//! reported outcome goes through its event API. This client is the only
//! thing in this crate that speaks HTTP to the server.

use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A leased unit of work, mirroring `noetl.queue` row shape on the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub queue_id: i64,
    pub execution_id: i64,
    pub catalog_id: i64,
    pub node_id: String,
    pub node_name: String,
    /// Tool kind the worker should dispatch to.
    pub action: String,
    /// Server-rendered task context; consumed verbatim.
    pub context: serde_json::Value,
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

#[derive(Debug, Clone, Serialize)]
struct LeaseRequest<'a> {
    worker_id: &'a str,
    lease_duration_secs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
struct LeaseResponse {
    entry: Option<QueueEntry>,
}

#[derive(Debug, Clone, Serialize)]
struct HeartbeatRequest<'a> {
    worker_id: &'a str,
    lease_duration_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct HeartbeatResponse {
    ok: bool,
}

#[derive(Debug, Clone, Serialize)]
struct WorkerIdRequest<'a> {
    worker_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct FailRequest<'a> {
    worker_id: &'a str,
    retry_allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    available_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
struct QueueEntryResponse {
    #[allow(dead_code)]
    entry: Option<QueueEntry>,
}

/// Worker-reported action event, matching the server's `EventRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEvent {
    pub execution_id: i64,
    pub node_name: String,
    /// One of `action_started` / `action_completed` / `action_error`.
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
struct EventResponse {
    #[allow(dead_code)]
    status: String,
    #[allow(dead_code)]
    event_id: i64,
}

#[derive(Debug, Clone, Serialize)]
struct ContextRenderRequest<'a> {
    execution_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    task: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    envelope: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct ContextRenderResponse {
    #[allow(dead_code)]
    context: serde_json::Value,
    rendered: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct KeychainGetResponse {
    status: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// HTTP client for control plane API.
#[derive(Clone)]
pub struct ControlPlaneClient {
    client: reqwest::Client,
    server_url: String,
}

impl ControlPlaneClient {
    /// Create a new control plane client.
    pub fn new(server_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            server_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    /// Lease the next available queue entry, if any.
    ///
    /// `None` means there was nothing to lease (server replies `204`, or an
    /// entry with `entry: null`).
    pub async fn lease(
        &self,
        worker_id: &str,
        lease_duration_secs: i64,
        action: Option<&str>,
    ) -> Result<Option<QueueEntry>> {
        let response = self
            .client
            .post(format!("{}/api/queue/lease", self.server_url))
            .json(&LeaseRequest {
                worker_id,
                lease_duration_secs,
                action,
            })
            .send()
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to lease queue entry: {}", body);
        }

        let parsed: LeaseResponse = response.json().await?;
        Ok(parsed.entry)
    }

    /// Extend a held lease. `false` means the lease was already stolen or
    /// the entry is no longer leased — the caller must abandon the job.
    pub async fn heartbeat(
        &self,
        queue_id: i64,
        worker_id: &str,
        lease_duration_secs: i64,
    ) -> Result<bool> {
        let response = self
            .client
            .post(format!("{}/api/queue/{}/heartbeat", self.server_url, queue_id))
            .json(&HeartbeatRequest {
                worker_id,
                lease_duration_secs,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to send lease heartbeat: {}", body);
        }

        let parsed: HeartbeatResponse = response.json().await?;
        Ok(parsed.ok)
    }

    /// Mark a queue entry done.
    pub async fn complete(&self, queue_id: i64, worker_id: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/queue/{}/complete", self.server_url, queue_id))
            .json(&WorkerIdRequest { worker_id })
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to complete queue entry: {}", body);
        }

        let _: QueueEntryResponse = response.json().await?;
        Ok(())
    }

    /// Report a failed queue entry. The server, not the worker, decides
    /// whether `retry_allowed` actually results in a requeue.
    pub async fn fail(
        &self,
        queue_id: i64,
        worker_id: &str,
        retry_allowed: bool,
        available_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/queue/{}/fail", self.server_url, queue_id))
            .json(&FailRequest {
                worker_id,
                retry_allowed,
                available_at,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to fail queue entry: {}", body);
        }

        let _: QueueEntryResponse = response.json().await?;
        Ok(())
    }

    /// Render a declared-but-unrendered task fragment (a `save:` block, or
    /// one iteration's `args`) against the execution's current context.
    /// `envelope`, when given, makes `result`/`this` available per the
    /// upstream task's own result envelope. `extra` adds further bindings,
    /// e.g. a mode-A iterator's `{loop.element: item}`.
    pub async fn render_context(
        &self,
        execution_id: i64,
        task: &serde_json::Value,
        envelope: Option<&serde_json::Value>,
        extra: HashMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(format!("{}/api/context/render", self.server_url))
            .json(&ContextRenderRequest {
                execution_id,
                task: Some(task),
                envelope,
                extra,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to render context: {}", body);
        }

        let parsed: ContextRenderResponse = response.json().await?;
        Ok(parsed.rendered.unwrap_or(serde_json::Value::Null))
    }

    /// Resolve a keychain credential by logical name (§4.9). `None` means
    /// not found or expired — the caller decides whether that's fatal.
    pub async fn get_keychain(
        &self,
        catalog_id: i64,
        keychain_name: &str,
        execution_id: Option<i64>,
    ) -> Result<Option<serde_json::Value>> {
        let mut url = format!(
            "{}/api/keychain/{}/{}",
            self.server_url, catalog_id, keychain_name
        );
        if let Some(execution_id) = execution_id {
            url.push_str(&format!("?execution_id={}", execution_id));
        }

        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to resolve keychain entry: {}", body);
        }

        let parsed: KeychainGetResponse = response.json().await?;
        if parsed.status != "found" {
            return Ok(None);
        }
        Ok(parsed.data)
    }

    /// Report an action event to the control plane.
    pub async fn emit_event(&self, event: WorkerEvent) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/events", self.server_url))
            .json(&event)
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to emit event: {}", body);
        }

        let _: EventResponse = response.json().await?;
        Ok(())
    }

    /// Emit an event with retry.
    pub async fn emit_event_with_retry(&self, event: WorkerEvent, max_retries: u32) -> Result<()> {
        let mut delay = Duration::from_millis(500);

        for attempt in 0..=max_retries {
            match self.emit_event(event.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < max_retries => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries,
                        error = %e,
                        "Event emission failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, Duration::from_secs(10));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Get a variable value for an execution.
    pub async fn get_variable(&self, execution_id: i64, name: &str) -> Result<Option<serde_json::Value>> {
        let response = self
            .client
            .get(format!("{}/api/vars/{}/{}", self.server_url, execution_id, name))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to get variable: {}", body);
        }

        let value: serde_json::Value = response.json().await?;
        Ok(Some(value))
    }

    /// Set a variable value for an execution.
    pub async fn set_variable(&self, execution_id: i64, name: &str, value: serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/vars/{}", self.server_url, execution_id))
            .json(&serde_json::json!({ name: value }))
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to set variable: {}", body);
        }

        Ok(())
    }

    /// Register the worker pool with the control plane.
    pub async fn register_worker(&self, worker_id: &str, pool_name: &str, hostname: &str) -> Result<()> {
        let mut labels = HashMap::new();
        labels.insert("worker_id".to_string(), serde_json::json!(worker_id));
        labels.insert("hostname".to_string(), serde_json::json!(hostname));

        let response = self
            .client
            .post(format!("{}/api/worker/pool/register", self.server_url))
            .json(&serde_json::json!({
                "name": pool_name,
                "kind": "worker_pool",
                "uri": hostname,
                "labels": labels,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to register worker: {}", body);
        }

        Ok(())
    }

    /// Send a heartbeat to the control plane for the worker pool's runtime row.
    pub async fn heartbeat_pool(&self, pool_name: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/api/worker/pool/heartbeat", self.server_url))
            .json(&serde_json::json!({
                "kind": "worker_pool",
                "name": pool_name,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("Pool heartbeat failed: {}", body);
        }

        Ok(())
    }

    /// Deregister the worker pool.
    pub async fn deregister_worker(&self, pool_name: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/api/worker/pool/deregister", self.server_url))
            .json(&serde_json::json!({
                "kind": "worker_pool",
                "name": pool_name,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("Deregister failed: {}", body);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_event_serialization() {
        let event = WorkerEvent {
            execution_id: 12345,
            node_name: "process".to_string(),
            event_type: "action_started".to_string(),
            result: None,
            worker_id: Some("worker-1".to_string()),
            attempt: None,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("action_started"));
        assert!(json.contains("12345"));
        assert!(!json.contains("\"attempt\""));
    }

    #[test]
    fn test_queue_entry_deserialization() {
        let json = serde_json::json!({
            "queue_id": 1,
            "execution_id": 12345,
            "catalog_id": 9,
            "node_id": "12345:process",
            "node_name": "process",
            "action": "shell",
            "context": {"args": {"command": "echo hi"}, "vars": null, "save": null},
            "meta": {"parent_event_id": 1},
            "priority": 0,
            "status": "leased",
            "attempts": 1,
            "max_attempts": 1,
            "available_at": "2026-01-01T00:00:00Z",
            "lease_until": "2026-01-01T00:01:00Z",
            "last_heartbeat": null,
            "worker_id": "worker-1",
            "created_at": "2026-01-01T00:00:00Z"
        });

        let entry: QueueEntry = serde_json::from_value(json).unwrap();
        assert_eq!(entry.execution_id, 12345);
        assert_eq!(entry.action, "shell");
    }

    #[test]
    fn test_client_creation() {
        let client = ControlPlaneClient::new("http://localhost:8082");
        assert_eq!(client.server_url, "http://localhost:8082");

        let client = ControlPlaneClient::new("http://localhost:8082/");
        assert_eq!(client.server_url, "http://localhost:8082");
    }
}
