//! NoETL DSL v2 Types
//!
//! Complete type definitions for NoETL playbooks:
//! - tool.kind pattern for tool configuration
//! - Step-level retry/next for event-driven control flow
//! - Step-level loop for iteration
//! - Event-driven architecture

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Supported tool kinds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Http,
    Postgres,
    Duckdb,
    Ducklake,
    Python,
    Workbook,
    Playbook,
    Playbooks,
    Secrets,
    Iterator,
    Container,
    Script,
    Snowflake,
    Transfer,
    SnowflakeTransfer,
    Gcs,
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolKind::Http => "http",
            ToolKind::Postgres => "postgres",
            ToolKind::Duckdb => "duckdb",
            ToolKind::Ducklake => "ducklake",
            ToolKind::Python => "python",
            ToolKind::Workbook => "workbook",
            ToolKind::Playbook => "playbook",
            ToolKind::Playbooks => "playbooks",
            ToolKind::Secrets => "secrets",
            ToolKind::Iterator => "iterator",
            ToolKind::Container => "container",
            ToolKind::Script => "script",
            ToolKind::Snowflake => "snowflake",
            ToolKind::Transfer => "transfer",
            ToolKind::SnowflakeTransfer => "snowflake_transfer",
            ToolKind::Gcs => "gcs",
        };
        write!(f, "{}", s)
    }
}

/// Tool specification with tool.kind pattern.
/// All execution-specific fields live under tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool type.
    pub kind: ToolKind,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: Option<serde_json::Value>,

    /// Libraries/dependencies.
    #[serde(default)]
    pub libs: Option<serde_json::Value>,

    /// Default arguments.
    #[serde(default)]
    pub args: Option<serde_json::Value>,

    /// Python code (for python tool).
    #[serde(default)]
    pub code: Option<String>,

    /// URL (for http tool).
    #[serde(default)]
    pub url: Option<String>,

    /// HTTP method (for http tool).
    #[serde(default)]
    pub method: Option<String>,

    /// Query/SQL (for database tools).
    #[serde(default)]
    pub query: Option<String>,

    /// Connection string or credential reference.
    #[serde(default)]
    pub connection: Option<String>,

    /// Additional tool-specific configuration.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Loop execution mode.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    #[default]
    Sequential,
    Parallel,
    Async,
}

/// Step-level loop configuration.
///
/// `collection`/`element` are the canonical field names; `in`/`iterator` are
/// accepted as aliases for playbooks written against the older surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loop {
    /// Jinja expression for the collection to iterate over.
    #[serde(alias = "in")]
    pub collection: String,

    /// Variable name bound to each item.
    #[serde(alias = "iterator")]
    pub element: String,

    /// Execution mode.
    #[serde(default)]
    pub mode: LoopMode,

    /// Optional filter expression; items for which this evaluates falsy are
    /// skipped before dispatch.
    #[serde(default, rename = "where")]
    pub where_expr: Option<String>,

    /// Optional ordering expression applied to the collection before iterating.
    #[serde(default)]
    pub order_by: Option<String>,

    /// Caps the number of items iterated.
    #[serde(default)]
    pub limit: Option<usize>,

    /// Batches items into groups of this size before dispatch (parallel mode).
    #[serde(default)]
    pub chunk: Option<usize>,
}

/// Target for next transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextTarget {
    /// Target step name.
    pub step: String,

    /// Arguments to pass to target step (legacy name, lowest precedence).
    #[serde(default)]
    pub args: Option<HashMap<String, serde_json::Value>>,

    /// Overlay context, highest precedence (`input > payload > with`).
    #[serde(default)]
    pub data: Option<HashMap<String, serde_json::Value>>,

    /// Overlay context, middle precedence.
    #[serde(default)]
    pub payload: Option<HashMap<String, serde_json::Value>>,

    /// Overlay context, lowest precedence alongside `args`.
    #[serde(default)]
    pub with: Option<HashMap<String, serde_json::Value>>,

    /// Guard condition; the target is only taken when this evaluates truthy.
    /// Absent means the target always matches. The broker evaluates every
    /// target whose guard matches — transitions are inclusive, not first-match
    /// (see `engine::evaluator`).
    #[serde(default)]
    pub when: Option<String>,
}

impl NextTarget {
    /// Merge `args`/`payload`/`with`/`data` into a single overlay context
    /// following the `input > payload > with` precedence rule (`data` is
    /// treated as the step's `input` override and wins over everything else).
    pub fn merged_overlay(&self) -> HashMap<String, serde_json::Value> {
        let mut merged = HashMap::new();
        if let Some(with) = &self.with {
            merged.extend(with.clone());
        }
        if let Some(args) = &self.args {
            merged.extend(args.clone());
        }
        if let Some(payload) = &self.payload {
            merged.extend(payload.clone());
        }
        if let Some(data) = &self.data {
            merged.extend(data.clone());
        }
        merged
    }
}

/// A single retry policy rule: `when` guards it, `then` carries the backoff
/// and recovery parameters. Rules are evaluated **first-match** (see
/// `engine::retry`), never all-match like `next:`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Jinja2 guard evaluated against the failed action's result/error.
    pub when: String,

    /// Backoff and recovery parameters for this rule.
    pub then: RetryThen,
}

/// Backoff and recovery parameters for a matched retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryThen {
    /// Maximum attempts before declaring terminal failure.
    pub max_attempts: i32,

    /// Delay, in seconds, before the first retry.
    #[serde(default)]
    pub initial_delay: f64,

    /// Multiplier applied to the delay on each subsequent attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound on the computed delay.
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,

    /// Whether to randomize the computed delay by `uniform(0.5, 1.5)`.
    #[serde(default)]
    pub jitter: bool,

    /// Optional step to re-invoke instead of the failed step on retry.
    #[serde(default)]
    pub next_call: Option<String>,

    /// Optional aggregation hint for iterator-mode retries.
    #[serde(default)]
    pub collect: Option<String>,

    /// Optional sink/save directive executed on recovery.
    #[serde(default)]
    pub sink: Option<serde_json::Value>,
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> f64 {
    300.0
}

/// Next step specification - can be string, list of strings, or list of targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NextSpec {
    /// Single step name.
    Single(String),

    /// List of step names.
    List(Vec<String>),

    /// List of step targets with optional args.
    Targets(Vec<NextTarget>),
}

/// Workflow step with event-driven control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name (unique identifier).
    pub step: String,

    /// Step description.
    #[serde(default)]
    pub desc: Option<String>,

    /// Input arguments for this step (from previous steps or templates).
    #[serde(default)]
    pub args: Option<HashMap<String, serde_json::Value>>,

    /// Variables to extract from step result.
    #[serde(default)]
    pub vars: Option<HashMap<String, serde_json::Value>>,

    /// Loop configuration.
    #[serde(default)]
    pub r#loop: Option<Loop>,

    /// Tool configuration with tool.kind.
    pub tool: ToolSpec,

    /// Pre-execution guard; the step is skipped (not dispatched) when this
    /// evaluates falsy. Absent means the step always runs.
    #[serde(default)]
    pub when: Option<String>,

    /// Retry policy: ordered `when`/`then` rules evaluated first-match
    /// against the failed action's result by the retry evaluator
    /// (`engine::retry`), independent of `next`'s broker-side transitions.
    #[serde(default)]
    pub retry: Option<Vec<RetryPolicy>>,

    /// Structural default next step(s) - unconditional.
    #[serde(default)]
    pub next: Option<NextSpec>,

    /// Result mapping for a terminal `end` step. When present, the broker
    /// evaluates the mapping against the final context and emits
    /// `execution_completed` carrying it as the execution's result.
    #[serde(default)]
    pub result: Option<HashMap<String, serde_json::Value>>,

    /// Sink/save directive executed after the primary task. Its template
    /// context unwraps the result envelope (`result = envelope.data`,
    /// `this = envelope`) per `template::jinja::TemplateRenderer::step_template_context`.
    #[serde(default)]
    pub save: Option<serde_json::Value>,
}

/// Reusable task definition in workbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkbookTask {
    /// Task name.
    pub name: String,

    /// Tool configuration.
    pub tool: ToolSpec,

    /// Optional sink/save directive, executed after the primary task in the
    /// same job. `sink` is accepted as an alias for `save`.
    #[serde(default, alias = "sink")]
    pub save: Option<serde_json::Value>,
}

/// Keychain entry for credential/token definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeychainDef {
    /// Keychain entry name.
    pub name: String,

    /// Credential reference.
    #[serde(default)]
    pub credential: Option<String>,

    /// Token type.
    #[serde(default)]
    pub token_type: Option<String>,

    /// Scope type.
    #[serde(default)]
    pub scope: Option<String>,

    /// Auto-renew flag.
    #[serde(default)]
    pub auto_renew: bool,

    /// Additional configuration.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Playbook metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Playbook name (required).
    pub name: String,

    /// Resource path.
    #[serde(default)]
    pub path: Option<String>,

    /// Description.
    #[serde(default)]
    pub description: Option<String>,

    /// Labels for filtering.
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,

    /// Additional metadata.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Complete workflow definition (v2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    /// API version (noetl.io/v2).
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (Playbook).
    pub kind: String,

    /// Metadata (name, path, labels).
    pub metadata: Metadata,

    /// Global workflow variables.
    #[serde(default)]
    pub workload: Option<serde_json::Value>,

    /// Keychain definitions for credentials and tokens.
    #[serde(default)]
    pub keychain: Option<Vec<KeychainDef>>,

    /// Reusable tasks.
    #[serde(default)]
    pub workbook: Option<Vec<WorkbookTask>>,

    /// Workflow steps.
    pub workflow: Vec<Step>,
}

impl Playbook {
    /// Check if workflow has a start step.
    pub fn has_start_step(&self) -> bool {
        self.workflow.iter().any(|s| s.step == "start")
    }

    /// Get a step by name.
    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.workflow.iter().find(|s| s.step == name)
    }

    /// Get all step names.
    pub fn step_names(&self) -> Vec<&str> {
        self.workflow.iter().map(|s| s.step.as_str()).collect()
    }

    /// Get the resource path.
    pub fn path(&self) -> Option<&str> {
        self.metadata.path.as_deref()
    }

    /// Get the playbook name.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_playbook() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: test_playbook
  path: test/simple
workflow:
  - step: start
    tool:
      kind: python
      code: |
        return {"status": "ok"}
    next:
      - step: end
  - step: end
    tool:
      kind: python
      code: |
        return {"status": "done"}
"#;

        let playbook: Playbook = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(playbook.api_version, "noetl.io/v2");
        assert_eq!(playbook.kind, "Playbook");
        assert_eq!(playbook.name(), "test_playbook");
        assert!(playbook.has_start_step());
        assert_eq!(playbook.workflow.len(), 2);
    }

    #[test]
    fn test_parse_playbook_with_loop() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: loop_test
workload:
  items: [1, 2, 3]
workflow:
  - step: start
    loop:
      collection: "{{ workload.items }}"
      element: item
      mode: sequential
    tool:
      kind: python
      code: |
        return {"item": input_data.get("item")}
    args:
      item: "{{ item }}"
"#;

        let playbook: Playbook = serde_yaml::from_str(yaml).unwrap();
        let step = playbook.get_step("start").unwrap();
        assert!(step.r#loop.is_some());
        let loop_config = step.r#loop.as_ref().unwrap();
        assert_eq!(loop_config.element, "item");
        assert_eq!(loop_config.mode, LoopMode::Sequential);
    }

    #[test]
    fn test_parse_playbook_with_loop_legacy_aliases() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: loop_alias_test
workflow:
  - step: start
    loop:
      in: "{{ workload.items }}"
      iterator: item
    tool:
      kind: python
      code: "return {}"
"#;

        let playbook: Playbook = serde_yaml::from_str(yaml).unwrap();
        let step = playbook.get_step("start").unwrap();
        let loop_config = step.r#loop.as_ref().unwrap();
        assert_eq!(loop_config.collection, "{{ workload.items }}");
        assert_eq!(loop_config.element, "item");
    }

    #[test]
    fn test_parse_playbook_with_retry() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: retry_test
workflow:
  - step: start
    tool:
      kind: http
      url: "https://example.com"
      method: GET
    retry:
      - when: "{{ this.status_code >= 500 }}"
        then:
          max_attempts: 3
          initial_delay: 1
          backoff_multiplier: 2
  - step: end
    tool:
      kind: python
      code: "return {}"
"#;

        let playbook: Playbook = serde_yaml::from_str(yaml).unwrap();
        let step = playbook.get_step("start").unwrap();
        assert!(step.retry.is_some());
        let policies = step.retry.as_ref().unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].then.max_attempts, 3);
        assert_eq!(policies[0].then.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_step_names() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: test
workflow:
  - step: start
    tool:
      kind: python
      code: ""
  - step: process
    tool:
      kind: python
      code: ""
  - step: end
    tool:
      kind: python
      code: ""
"#;

        let playbook: Playbook = serde_yaml::from_str(yaml).unwrap();
        let names = playbook.step_names();
        assert_eq!(names, vec!["start", "process", "end"]);
    }
}
