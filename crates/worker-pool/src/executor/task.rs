//! Task dispatch (§4.8): runs a leased queue entry's primary tool call and,
//! on success, its `save:` sink directive.

use anyhow::Result;
use noetl_tools::context::ExecutionContext;
use noetl_tools::registry::{AuthConfig, ToolConfig, ToolRegistry};
use noetl_tools::result::{ToolResult, ToolStatus};
use noetl_tools::tools::create_default_registry;
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::client::{ControlPlaneClient, QueueEntry};

/// Executes one leased job: the primary tool call, mode-A iteration, and
/// the `save:` sink. Case/when/then evaluation does not exist here —
/// retries and branching are server-decided (§4.8).
pub struct TaskExecutor {
    tool_registry: ToolRegistry,
    client: ControlPlaneClient,
    worker_id: String,
}

impl TaskExecutor {
    pub fn new(client: ControlPlaneClient, worker_id: String) -> Self {
        Self {
            tool_registry: create_default_registry(),
            client,
            worker_id,
        }
    }

    /// Run `entry` and return its result envelope `{status, data|error}`.
    /// An `Err` here means the job itself could not be dispatched (e.g. a
    /// malformed context) rather than the task reporting failure — both are
    /// treated as a failed job by the caller.
    pub async fn execute(&self, entry: &QueueEntry) -> Result<Value> {
        if let Some(items) = entry.context.get("_loop_items").and_then(|v| v.as_array()) {
            return self.execute_iteration(entry, items).await;
        }

        self.execute_single(entry).await
    }

    async fn execute_single(&self, entry: &QueueEntry) -> Result<Value> {
        let args = entry.context.get("args").cloned().unwrap_or(Value::Null);
        let auth = self.parse_auth(entry);
        let mut ctx = self.build_context(entry);
        if let Some(auth) = &auth {
            self.resolve_credential(entry, auth, &mut ctx).await?;
        }
        let envelope = self.run_tool(&entry.action, args, auth, &ctx).await;

        if !is_success(&envelope) {
            return Ok(envelope);
        }

        match entry.context.get("save").filter(|v| !v.is_null()) {
            Some(save) => match self.run_save(entry, save, &envelope).await {
                Ok(()) => Ok(envelope),
                Err(e) => Ok(error_envelope(format!("save directive failed: {e}"))),
            },
            None => Ok(envelope),
        }
    }

    /// Mode-A iteration: one tool call per item, `loop.element` bound per
    /// pass via the control plane's context renderer (only it knows the
    /// execution's current template context).
    async fn execute_iteration(&self, entry: &QueueEntry, items: &[Value]) -> Result<Value> {
        let element = entry
            .context
            .get("loop")
            .and_then(|l| l.get("element"))
            .and_then(|v| v.as_str())
            .unwrap_or("item")
            .to_string();
        let args_template = entry.context.get("args").cloned().unwrap_or(Value::Null);
        let auth = self.parse_auth(entry);
        let mut base_ctx = self.build_context(entry);
        if let Some(auth) = &auth {
            self.resolve_credential(entry, auth, &mut base_ctx).await?;
        }

        let mut results = Vec::with_capacity(items.len());
        let mut success = 0usize;
        let mut failed = 0usize;

        for item in items {
            let mut extra = HashMap::new();
            extra.insert(element.clone(), item.clone());
            let rendered_args = self
                .client
                .render_context(entry.execution_id, &args_template, None, extra)
                .await?;

            let ctx = base_ctx.clone();
            let envelope = self.run_tool(&entry.action, rendered_args, auth.clone(), &ctx).await;
            if is_success(&envelope) {
                success += 1;
            } else {
                failed += 1;
            }
            results.push(envelope);
        }

        let stats = json!({"total": items.len(), "success": success, "failed": failed});
        let status = if failed == 0 { "success" } else { "error" };
        Ok(json!({
            "status": status,
            "data": {"results": results, "stats": stats},
        }))
    }

    async fn run_save(&self, entry: &QueueEntry, save: &Value, envelope: &Value) -> Result<()> {
        let rendered = self
            .client
            .render_context(entry.execution_id, save, Some(envelope), HashMap::new())
            .await?;
        let config: ToolConfig = serde_json::from_value(rendered)?;
        let ctx = self.build_context(entry);
        self.tool_registry
            .execute_from_config(&config, &ctx)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        Ok(())
    }

    async fn run_tool(&self, kind: &str, config: Value, auth: Option<AuthConfig>, ctx: &ExecutionContext) -> Value {
        let tool_config = ToolConfig {
            kind: kind.to_string(),
            config,
            timeout: None,
            retry: None,
            auth,
        };

        match self.tool_registry.execute_from_config(&tool_config, ctx).await {
            Ok(result) => envelope_from_result(&result),
            Err(e) => error_envelope(e.to_string()),
        }
    }

    fn build_context(&self, entry: &QueueEntry) -> ExecutionContext {
        ExecutionContext::new(entry.execution_id, entry.node_name.clone(), "").with_worker_id(&self.worker_id)
    }

    /// Parse the step's `auth:` declaration, forwarded verbatim (already
    /// rendered) in the queue entry's context.
    fn parse_auth(&self, entry: &QueueEntry) -> Option<AuthConfig> {
        entry
            .context
            .get("auth")
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Resolve an `auth.credential` reference against the keychain and bind
    /// it into `ctx.secrets` under its own name, so `AuthResolver::resolve`
    /// finds it the same way it would a locally-set secret (§4.9).
    async fn resolve_credential(
        &self,
        entry: &QueueEntry,
        auth: &AuthConfig,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let Some(credential) = &auth.credential else {
            return Ok(());
        };

        let data = self
            .client
            .get_keychain(entry.catalog_id, credential, Some(entry.execution_id))
            .await?
            .ok_or_else(|| anyhow::anyhow!("credential '{credential}' not found in keychain"))?;

        ctx.set_secret(credential.clone(), keychain_value_to_secret(&data));
        Ok(())
    }
}

/// Keychain data is an arbitrary JSON blob; pick the conventional field a
/// bearer/basic/api-key credential carries, falling back to the whole blob.
fn keychain_value_to_secret(data: &Value) -> String {
    if let Value::String(s) = data {
        return s.clone();
    }
    for key in ["token", "access_token", "api_key", "password", "value"] {
        if let Some(Value::String(s)) = data.get(key) {
            return s.clone();
        }
    }
    data.to_string()
}

fn envelope_from_result(result: &ToolResult) -> Value {
    match result.status {
        ToolStatus::Success => json!({
            "status": "success",
            "data": result.data.clone().unwrap_or(Value::Null),
        }),
        ToolStatus::Error | ToolStatus::Timeout => error_envelope(
            result
                .error
                .clone()
                .unwrap_or_else(|| "tool execution failed".to_string()),
        ),
    }
}

fn error_envelope(message: String) -> Value {
    json!({"status": "error", "error": message})
}

fn is_success(envelope: &Value) -> bool {
    envelope.get("status").and_then(|v| v.as_str()) == Some("success")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_from_result_success() {
        let result = ToolResult::success(json!({"x": 1}));
        let envelope = envelope_from_result(&result);
        assert_eq!(envelope["status"], "success");
        assert_eq!(envelope["data"]["x"], 1);
    }

    #[test]
    fn test_envelope_from_result_error() {
        let result = ToolResult::error("boom");
        let envelope = envelope_from_result(&result);
        assert_eq!(envelope["status"], "error");
        assert_eq!(envelope["error"], "boom");
    }

    #[test]
    fn test_is_success() {
        assert!(is_success(&json!({"status": "success"})));
        assert!(!is_success(&json!({"status": "error"})));
    }

    #[test]
    fn test_task_executor_creation() {
        let client = ControlPlaneClient::new("http://localhost:8082");
        let executor = TaskExecutor::new(client, "worker-1".to_string());
        assert!(executor.tool_registry.has("shell"));
        assert!(executor.tool_registry.has("http"));
    }

    #[test]
    fn test_keychain_value_to_secret_prefers_known_fields() {
        assert_eq!(keychain_value_to_secret(&json!("plain")), "plain");
        assert_eq!(
            keychain_value_to_secret(&json!({"access_token": "abc", "expires_in": 3600})),
            "abc"
        );
        assert_eq!(keychain_value_to_secret(&json!({"unrecognized": "x"})), "{\"unrecognized\":\"x\"}");
    }

    #[test]
    fn test_parse_auth_absent() {
        let client = ControlPlaneClient::new("http://localhost:8082");
        let executor = TaskExecutor::new(client, "worker-1".to_string());
        let entry: QueueEntry = serde_json::from_value(json!({
            "queue_id": 1, "execution_id": 1, "catalog_id": 1, "node_id": "1:s", "node_name": "s",
            "action": "http", "context": {"args": {}}, "meta": {}, "priority": 0, "status": "leased",
            "attempts": 1, "max_attempts": 1, "available_at": "2026-01-01T00:00:00Z",
            "lease_until": null, "last_heartbeat": null, "worker_id": null,
            "created_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(executor.parse_auth(&entry).is_none());
    }
}
