//! Evaluation context builder (SPEC_FULL.md §4.5.c).
//!
//! Every transition, retry, and template render sees the same shape:
//! `{ workload, execution_id, <step_name>: <step_result> for every
//! completed step, vars, _meta }`. This module is the single place that
//! assembles it so the broker, retry evaluator, and context-render endpoint
//! agree on what "the context" means.
//!
//! Context accumulation grows with the number of completed steps and is
//! unbounded across an execution's lifetime — a long-running execution with
//! thousands of steps holds all of their results in memory for every
//! subsequent evaluation. This matches the source system's behavior and is
//! left unmitigated (SPEC_FULL.md §9 Open Question #4); a future bound would
//! cap retained results to the steps actually referenced by `next.when`/
//! `retry.when` expressions still reachable from the current position.

use std::collections::HashMap;

use serde_json::Value;

use crate::db::queries::event as event_queries;
use crate::db::DbPool;
use crate::error::AppResult;

/// The broker's evaluation context for a given point in an execution.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub execution_id: i64,
    pub workload: Value,
    pub step_results: HashMap<String, Value>,
    pub vars: HashMap<String, Value>,
    pub meta: Value,
}

impl EvaluationContext {
    /// Flatten into the `HashMap<String, Value>` shape the template renderer
    /// and condition evaluator consume.
    pub fn to_template_map(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("workload".to_string(), self.workload.clone());
        map.insert("execution_id".to_string(), Value::from(self.execution_id));
        map.insert(
            "vars".to_string(),
            Value::Object(self.vars.clone().into_iter().collect()),
        );
        map.insert("_meta".to_string(), self.meta.clone());
        for (step_name, result) in &self.step_results {
            map.insert(step_name.clone(), result.clone());
        }
        map
    }
}

/// Build the evaluation context for `execution_id` after step `completed_event_id`
/// on `completed_node_name` just produced `step_completed`.
pub async fn build_evaluation_context(
    pool: &DbPool,
    execution_id: i64,
    completed_event_id: i64,
    parent_execution_id: Option<i64>,
) -> AppResult<EvaluationContext> {
    let started = event_queries::get_execution_started_event(pool, execution_id).await?;
    let workload = started
        .as_ref()
        .and_then(|e| e.context.as_ref())
        .and_then(|c| c.get("workload"))
        .cloned()
        .unwrap_or(Value::Null);

    let step_results: HashMap<String, Value> = event_queries::get_all_step_results(pool, execution_id)
        .await?
        .into_iter()
        .collect();

    let meta = serde_json::json!({
        "parent_event_id": completed_event_id,
        "parent_execution_id": parent_execution_id,
    });

    Ok(EvaluationContext {
        execution_id,
        workload,
        step_results,
        vars: HashMap::new(),
        meta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_template_map_includes_step_results() {
        let mut step_results = HashMap::new();
        step_results.insert("start".to_string(), serde_json::json!({"ok": true}));

        let ctx = EvaluationContext {
            execution_id: 42,
            workload: serde_json::json!({"a": 1}),
            step_results,
            vars: HashMap::new(),
            meta: serde_json::json!({}),
        };

        let map = ctx.to_template_map();
        assert_eq!(map.get("execution_id"), Some(&serde_json::json!(42)));
        assert_eq!(map.get("start"), Some(&serde_json::json!({"ok": true})));
        assert_eq!(map.get("workload"), Some(&serde_json::json!({"a": 1})));
    }
}
