//! Iterator controller (C7, SPEC_FULL.md §4.7).
//!
//! Expands a step carrying `loop: { collection, element, mode, where?,
//! order_by?, limit?, chunk? }` into per-item work, in one of two modes:
//!
//! - **Mode A** (worker-side): a single queue entry carries the whole loop
//!   config; the worker iterates in-process and emits one `action_completed`
//!   with `{ results, stats }`.
//! - **Mode B** (child-playbook, `tool.kind == playbook`): one nested
//!   execution per item. `check_child_completion` is invoked by the broker
//!   whenever a child's `execution_completed`/`execution_failed` arrives and
//!   aggregates once every dispatched child has reached a terminal event.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;

use crate::db::models::Event;
use crate::db::queries::event as event_queries;
use crate::db::snowflake;
use crate::db::DbPool;
use crate::engine::aggregate::{aggregate, envelope_data};
use crate::engine::evaluator::ConditionEvaluator;
use crate::error::AppResult;
use crate::playbook::types::{Loop, Step, ToolKind};
use crate::services::event::EmitEventRequest;
use crate::services::{EventService, QueueService};
use crate::template::TemplateRenderer;

pub struct IteratorController {
    pool: DbPool,
    events: EventService,
    queue: QueueService,
    evaluator: ConditionEvaluator,
    renderer: TemplateRenderer,
}

impl IteratorController {
    pub fn new(pool: DbPool, events: EventService, queue: QueueService) -> Self {
        Self {
            pool,
            events,
            queue,
            evaluator: ConditionEvaluator::new(),
            renderer: TemplateRenderer::new(),
        }
    }

    /// Resolve the iteration items for `loop_cfg` against `ctx`, applying
    /// `where`, `order_by`, and `limit` in that order.
    fn resolve_items(
        &self,
        loop_cfg: &Loop,
        ctx: &HashMap<String, Value>,
    ) -> AppResult<Vec<Value>> {
        let mut items = self.evaluator.evaluate_loop(&loop_cfg.collection, ctx)?;

        if let Some(where_expr) = &loop_cfg.where_expr {
            let mut kept = Vec::new();
            for item in items {
                let mut item_ctx = ctx.clone();
                item_ctx.insert(loop_cfg.element.clone(), item.clone());
                if self.evaluator.evaluate_condition(where_expr, &item_ctx)? {
                    kept.push(item);
                }
            }
            items = kept;
        }

        if let Some(order_by) = &loop_cfg.order_by {
            let mut keyed: Vec<(String, Value)> = Vec::with_capacity(items.len());
            for item in items {
                let mut item_ctx = ctx.clone();
                item_ctx.insert(loop_cfg.element.clone(), item.clone());
                let key = self.renderer.render(order_by, &item_ctx)?;
                keyed.push((key, item));
            }
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
            items = keyed.into_iter().map(|(_, v)| v).collect();
        }

        if let Some(limit) = loop_cfg.limit {
            items.truncate(limit);
        }

        Ok(items)
    }

    /// Expand step `step` (already known to carry `loop:`) for `execution_id`.
    /// `ctx` is the broker's evaluation context at the point of dispatch;
    /// `parent_event_id` is the `step_started` event just emitted for this step.
    pub async fn expand(
        &self,
        execution_id: i64,
        catalog_id: i64,
        step: &Step,
        ctx: &HashMap<String, Value>,
        parent_event_id: i64,
    ) -> AppResult<()> {
        let loop_cfg = step.r#loop.as_ref().expect("expand called without loop config");
        let items = self.resolve_items(loop_cfg, ctx)?;
        let node_id = format!("{execution_id}:{}", step.step);

        if items.is_empty() {
            let envelope = serde_json::json!({
                "status": "success",
                "data": {"results": Value::Array(vec![]), "stats": {"total": 0, "success": 0, "failed": 0}},
            });
            let event_id = snowflake::generate(&self.pool).await?;
            self.events
                .emit(EmitEventRequest {
                    event_id,
                    execution_id,
                    catalog_id: Some(catalog_id),
                    event_type: "action_completed".to_string(),
                    parent_event_id: Some(parent_event_id),
                    parent_execution_id: None,
                    node_id: Some(node_id),
                    node_name: Some(step.step.clone()),
                    node_type: Some("step".to_string()),
                    status: "COMPLETED".to_string(),
                    context: None,
                    meta: Some(serde_json::json!({"iteration_count": 0})),
                    result: Some(envelope),
                    worker_id: None,
                    attempt: None,
                })
                .await?;
            return Ok(());
        }

        if step.tool.kind == ToolKind::Playbook {
            self.expand_child_playbooks(execution_id, catalog_id, step, &items, parent_event_id)
                .await
        } else {
            self.expand_worker_side(execution_id, catalog_id, step, loop_cfg, &items, parent_event_id, ctx)
                .await
        }
    }

    /// Mode A: single queue entry, worker iterates in-process.
    #[allow(clippy::too_many_arguments)]
    async fn expand_worker_side(
        &self,
        execution_id: i64,
        catalog_id: i64,
        step: &Step,
        loop_cfg: &Loop,
        items: &[Value],
        parent_event_id: i64,
        ctx: &HashMap<String, Value>,
    ) -> AppResult<()> {
        let node_id = format!("{execution_id}:{}", step.step);
        // `args` is carried unrendered: each item needs `{{ item.field }}`
        // substituted against its own binding of `loop.element`, which only
        // the worker's per-item loop can do (§4.7 mode A is the one place
        // templates are evaluated outside this server, by design). `auth`
        // has no per-item binding, so it's rendered once here like the
        // non-loop path (§4.9).
        let rendered_auth = match &step.tool.auth {
            Some(a) => self.renderer.render_value(a, ctx)?,
            None => Value::Null,
        };
        let context = serde_json::json!({
            "args": step.args,
            "loop": {
                "element": loop_cfg.element,
                "mode": loop_cfg.mode,
                "chunk": loop_cfg.chunk,
            },
            "_loop_items": items,
            "auth": rendered_auth,
        });
        let meta = serde_json::json!({"parent_event_id": parent_event_id});

        self.queue
            .enqueue(
                execution_id,
                catalog_id,
                &node_id,
                &step.step,
                &step.tool.kind.to_string(),
                &context,
                &meta,
                0,
                Utc::now(),
                1,
            )
            .await?;

        Ok(())
    }

    /// Mode B: one nested execution per item, tracked via `iteration_started`
    /// markers and their matching child `execution_started` events.
    async fn expand_child_playbooks(
        &self,
        execution_id: i64,
        catalog_id: i64,
        step: &Step,
        items: &[Value],
        parent_event_id: i64,
    ) -> AppResult<()> {
        let child_path = step
            .tool
            .extra
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(&step.step)
            .to_string();

        for (index, item) in items.iter().enumerate() {
            let iteration_event_id = snowflake::generate(&self.pool).await?;
            self.events
                .emit(EmitEventRequest {
                    event_id: iteration_event_id,
                    execution_id,
                    catalog_id: Some(catalog_id),
                    event_type: "iteration_started".to_string(),
                    parent_event_id: Some(parent_event_id),
                    parent_execution_id: None,
                    node_id: Some(format!("{execution_id}:{}:{}", step.step, index)),
                    node_name: Some(step.step.clone()),
                    node_type: Some("iteration".to_string()),
                    status: "STARTED".to_string(),
                    context: None,
                    meta: Some(serde_json::json!({
                        "iteration_index": index,
                        "iteration_count": items.len(),
                        "iteration_item": item,
                    })),
                    result: None,
                    worker_id: None,
                    attempt: None,
                })
                .await?;

            let node_id = format!("{execution_id}:{}:{}", step.step, index);
            let context = serde_json::json!({
                "path": child_path,
                "item": item,
                "args": step.args,
                "parent_execution_id": execution_id,
                "parent_event_id": iteration_event_id,
            });
            let meta = serde_json::json!({
                "parent_event_id": iteration_event_id,
                "iteration_index": index,
            });

            self.queue
                .enqueue(
                    execution_id,
                    catalog_id,
                    &node_id,
                    &step.step,
                    &ToolKind::Playbook.to_string(),
                    &context,
                    &meta,
                    0,
                    Utc::now(),
                    1,
                )
                .await?;
        }

        Ok(())
    }

    /// Re-check whether all children of a mode-B iterator have finished, and
    /// aggregate if so. `parent_execution_id` is the iterator's own execution
    /// (i.e. the execution owning the step with `loop:`).
    pub async fn check_child_completion(&self, parent_execution_id: i64) -> AppResult<()> {
        let iteration_markers: Vec<Event> =
            event_queries::get_events_by_execution(&self.pool, parent_execution_id, Some("iteration_started"), None)
                .await?;

        if iteration_markers.is_empty() {
            return Ok(());
        }

        // Group by node_name (the iterator step); re-evaluate each group.
        let mut by_step: HashMap<String, Vec<&Event>> = HashMap::new();
        for marker in &iteration_markers {
            if let Some(name) = &marker.node_name {
                by_step.entry(name.clone()).or_default().push(marker);
            }
        }

        for (step_name, markers) in by_step {
            // Already aggregated for this step.
            if event_queries::has_event_type(&self.pool, parent_execution_id, "iterator_completed").await?
                && event_queries::get_step_result(&self.pool, parent_execution_id, &step_name)
                    .await?
                    .is_some()
            {
                continue;
            }

            let mut terminal: Vec<(i64, Event)> = Vec::new();
            let mut all_done = true;
            for marker in &markers {
                let index = marker
                    .meta
                    .as_ref()
                    .and_then(|m| m.get("iteration_index"))
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);

                let child_started =
                    event_queries::get_child_execution_started(&self.pool, marker.event_id).await?;
                let child_started = match child_started {
                    Some(e) => e,
                    None => {
                        all_done = false;
                        continue;
                    }
                };

                let child_terminal =
                    event_queries::get_execution_terminal_event(&self.pool, child_started.execution_id)
                        .await?;
                match child_terminal {
                    Some(e) => terminal.push((index, e)),
                    None => all_done = false,
                }
            }

            if !all_done || terminal.len() != markers.len() {
                continue;
            }

            terminal.sort_by_key(|(index, _)| *index);
            let total = terminal.len();
            let mut success = 0usize;
            let mut failed = 0usize;
            let results: Vec<Value> = terminal
                .iter()
                .map(|(_, e)| {
                    if e.event_type == "execution_completed" {
                        success += 1;
                    } else {
                        failed += 1;
                    }
                    envelope_data(&e.result.clone().unwrap_or(Value::Null))
                })
                .collect();
            let aggregated = aggregate("append", results);

            let parent_event_id = markers[0].parent_event_id;
            let catalog_id = markers[0].catalog_id;
            let node_id = format!("{parent_execution_id}:{step_name}");

            let completed_envelope = serde_json::json!({
                "status": "success",
                "data": {
                    "results": aggregated,
                    "stats": {"total": total, "success": success, "failed": failed},
                },
            });

            let action_event_id = snowflake::generate(&self.pool).await?;
            self.events
                .emit(EmitEventRequest {
                    event_id: action_event_id,
                    execution_id: parent_execution_id,
                    catalog_id: Some(catalog_id),
                    event_type: "action_completed".to_string(),
                    parent_event_id,
                    parent_execution_id: None,
                    node_id: Some(node_id.clone()),
                    node_name: Some(step_name.clone()),
                    node_type: Some("step".to_string()),
                    status: "COMPLETED".to_string(),
                    context: None,
                    meta: Some(serde_json::json!({"iteration_count": total})),
                    result: Some(completed_envelope.clone()),
                    worker_id: None,
                    attempt: None,
                })
                .await?;

            let iterator_event_id = snowflake::generate(&self.pool).await?;
            self.events
                .emit(EmitEventRequest {
                    event_id: iterator_event_id,
                    execution_id: parent_execution_id,
                    catalog_id: Some(catalog_id),
                    event_type: "iterator_completed".to_string(),
                    parent_event_id: Some(action_event_id),
                    parent_execution_id: None,
                    node_id: Some(node_id),
                    node_name: Some(step_name),
                    node_type: Some("step".to_string()),
                    status: "COMPLETED".to_string(),
                    context: None,
                    meta: None,
                    result: Some(completed_envelope),
                    worker_id: None,
                    attempt: None,
                })
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_items_applies_limit() {
        // Exercised indirectly through ConditionEvaluator::evaluate_loop,
        // which is covered in engine::evaluator's own tests; here we only
        // check the truncation logic compiles against a plain Vec.
        let mut items = vec![serde_json::json!(1), serde_json::json!(2), serde_json::json!(3)];
        items.truncate(2);
        assert_eq!(items.len(), 2);
    }
}
