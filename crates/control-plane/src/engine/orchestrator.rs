//! Reactive workflow broker (C2, SPEC_FULL.md §4.5).
//!
//! `WorkflowBroker` is the `EventListener` registered with `EventService` at
//! startup (`EventService::register_listener`). Every append calls
//! `EventService::notify`, which calls `on_event` synchronously on every
//! listener — that fan-out, not a polling loop, is what drives dispatch.
//! `route_event` re-loads the triggering event and reacts:
//!
//! - `execution_started` → resolve the playbook, enter the `start` step.
//! - `action_completed` / `iterator_completed` → mark `step_completed`
//!   (idempotent), evaluate `next:` (all-match fan-out, `engine::evaluator`),
//!   and either enter every matched next step or, if the completed step
//!   carries a `result:` mapping, render it and emit `execution_completed`.
//! - `action_error` → delegate entirely to `RetryEvaluator::handle`.
//!
//! Every mutation this module performs — `insert_event_guarded` for markers,
//! `ON CONFLICT DO NOTHING` for queue entries — is idempotent, so a
//! `route_event` call that runs more than once for the same event (possible
//! since `notify` also re-fires listeners against a parent execution's latest
//! event) never double-dispatches a step.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::db::models::{CatalogEntryRequest, Event};
use crate::db::queries::event::ExecutionClass;
use crate::db::snowflake;
use crate::db::DbPool;
use crate::engine::context;
use crate::engine::evaluator::ConditionEvaluator;
use crate::engine::iterator::IteratorController;
use crate::engine::planner::Planner;
use crate::engine::retry::RetryEvaluator;
use crate::error::{AppError, AppResult};
use crate::playbook::parser;
use crate::playbook::types::{Playbook, Step};
use crate::services::event::{EmitEventRequest, EventListener};
use crate::services::{CatalogService, EventService, QueueService};
use crate::template::TemplateRenderer;

pub struct WorkflowBroker {
    pool: DbPool,
    catalog: CatalogService,
    events: EventService,
    queue: QueueService,
    planner: Planner,
    evaluator: ConditionEvaluator,
    retry: RetryEvaluator,
    iterator: IteratorController,
    renderer: TemplateRenderer,
}

impl WorkflowBroker {
    pub fn new(
        pool: DbPool,
        catalog: CatalogService,
        events: EventService,
        queue: QueueService,
    ) -> Self {
        let retry = RetryEvaluator::new(pool.clone(), catalog.clone(), events.clone(), queue.clone());
        let iterator = IteratorController::new(pool.clone(), events.clone(), queue.clone());
        let planner = Planner::new(pool.clone(), catalog.clone(), events.clone());
        Self {
            pool,
            catalog,
            events,
            queue,
            planner,
            evaluator: ConditionEvaluator::new(),
            retry,
            iterator,
            renderer: TemplateRenderer::new(),
        }
    }

    /// Entry point invoked for every appended event. Unrelated event types
    /// (`step_started`, `step_retry`, worker heartbeats, etc.) are no-ops.
    pub async fn route_event(&self, event_id: i64) -> AppResult<()> {
        let event = match self.events.get_event(event_id).await? {
            Some(e) => e,
            None => return Ok(()),
        };

        // Invariant 5 / §4.5: once an execution has an `execution_completed`
        // or `execution_failed` event, all further routing is a no-op. This
        // is the event's own `execution_started`, so classify before acting
        // on anything — a terminal event can be appended for execution E
        // and then a late, unrelated `action_completed` for the same E can
        // still arrive (e.g. the losing half of a B3 fan-out racing a
        // sibling branch's terminal failure); it must not re-enter
        // `on_step_result` and enqueue more work or emit a second terminal
        // event.
        if self.events.classify_execution(event.execution_id).await? == ExecutionClass::Completed {
            return Ok(());
        }

        match event.event_type.as_str() {
            "execution_started" => self.dispatch_start(&event).await?,
            "action_error" | "action_failed" => self.retry.handle(&event).await?,
            "action_completed" | "iterator_completed" => self.on_step_result(&event).await?,
            _ => {}
        }

        // A child execution's terminal event wakes the parent's latest event
        // via EventService::notify; whatever that event turns out to be, use
        // the occasion to re-check any mode-B loop this execution is running.
        self.iterator.check_child_completion(event.execution_id).await?;

        Ok(())
    }

    async fn load_playbook(&self, catalog_id: i64) -> AppResult<Playbook> {
        let entry = self
            .catalog
            .get_resource(CatalogEntryRequest {
                catalog_id: Some(catalog_id.to_string()),
                path: None,
                version: None,
            })
            .await?;
        parser::parse_playbook(&entry.content)
    }

    async fn dispatch_start(&self, event: &Event) -> AppResult<()> {
        let execution_id = event.execution_id;
        let catalog_id = event.catalog_id;
        let playbook = self
            .planner
            .plan(execution_id, catalog_id, event.event_id)
            .await?;

        let start_step = playbook.get_step("start").ok_or_else(|| {
            AppError::Validation(format!(
                "playbook '{}' has no 'start' step",
                playbook.name()
            ))
        })?;

        let ctx = context::build_evaluation_context(&self.pool, execution_id, event.event_id, event.parent_execution_id)
            .await?
            .to_template_map();

        self.enter_step(execution_id, catalog_id, &playbook, start_step, event.event_id, &ctx, None)
            .await
    }

    /// Emit `step_started` (idempotent) and dispatch `step` — loop expansion
    /// or a direct queue entry — with `parent_event_id` as lineage.
    async fn enter_step(
        &self,
        execution_id: i64,
        catalog_id: i64,
        playbook: &Playbook,
        step: &Step,
        parent_event_id: i64,
        ctx: &HashMap<String, Value>,
        overlay: Option<Value>,
    ) -> AppResult<()> {
        if !self.evaluator.evaluate_step_when(step, ctx)? {
            tracing::debug!(execution_id, step = %step.step, "step guard false, not entering");
            return Ok(());
        }

        let node_id = format!("{execution_id}:{}", step.step);
        let started_id = snowflake::generate(&self.pool).await?;
        self.events
            .emit(EmitEventRequest {
                event_id: started_id,
                execution_id,
                catalog_id: Some(catalog_id),
                event_type: "step_started".to_string(),
                parent_event_id: Some(parent_event_id),
                parent_execution_id: None,
                node_id: Some(node_id.clone()),
                node_name: Some(step.step.clone()),
                node_type: Some("step".to_string()),
                status: "STARTED".to_string(),
                context: None,
                meta: None,
                result: None,
                worker_id: None,
                attempt: None,
            })
            .await?;

        if step.r#loop.is_some() {
            return self
                .iterator
                .expand(execution_id, catalog_id, step, ctx, started_id)
                .await;
        }

        // Payload precedence (§4.5.c): the transition's merged `input >
        // payload > with` overlay wins over the target step's own `args`.
        // Rendering happens here, once, so the queue entry's `context` is
        // the authoritative, fully-evaluated task the worker consumes
        // verbatim (§4.8) — the worker never re-evaluates templates for it.
        let mut merged_args = step.args.clone().unwrap_or_default();
        if let Some(Value::Object(overlay_map)) = &overlay {
            for (k, v) in overlay_map {
                merged_args.insert(k.clone(), v.clone());
            }
        }
        let rendered_args = self
            .renderer
            .render_value(&serde_json::to_value(&merged_args).unwrap_or(Value::Null), ctx)?;
        let rendered_vars = match &step.vars {
            Some(v) => self
                .renderer
                .render_value(&serde_json::to_value(v).unwrap_or(Value::Null), ctx)?,
            None => Value::Null,
        };
        let rendered_auth = match &step.tool.auth {
            Some(a) => self.renderer.render_value(a, ctx)?,
            None => Value::Null,
        };
        let context_value = serde_json::json!({
            "args": rendered_args,
            "vars": rendered_vars,
            // `save:` is rendered by the worker after the primary task
            // completes — its template context unwraps the task's own
            // result envelope, which isn't known until then (§9 open
            // question 5), so it's carried as declared templates, not
            // pre-rendered here.
            "save": step.save,
            // Forwarded verbatim (already rendered) so the worker can
            // resolve a `credential:` reference against the keychain
            // without needing anything else from the step (§4.9).
            "auth": rendered_auth,
        });
        let meta = serde_json::json!({"parent_event_id": started_id});

        self.queue
            .enqueue(
                execution_id,
                catalog_id,
                &node_id,
                &step.step,
                &step.tool.kind.to_string(),
                &context_value,
                &meta,
                0,
                chrono::Utc::now(),
                1,
            )
            .await?;

        let _ = playbook;
        Ok(())
    }

    /// A step's action finished successfully. Check for pagination first,
    /// then mark `step_completed`, evaluate `next:`, and either enter every
    /// matched next step or — if this step carries a `result:` mapping —
    /// complete the execution.
    async fn on_step_result(&self, event: &Event) -> AppResult<()> {
        let execution_id = event.execution_id;
        let node_name = match &event.node_name {
            Some(n) => n.clone(),
            None => return Ok(()),
        };

        // Re-check: `route_event` already classified the execution before
        // calling in, but a sibling fan-out branch's terminal event can land
        // between that check and this call reaching the database, so the
        // guard is repeated here rather than trusted from the caller alone.
        if self.events.classify_execution(execution_id).await? == ExecutionClass::Completed {
            return Ok(());
        }

        if self.retry.maybe_paginate(execution_id, &node_name).await? {
            return Ok(());
        }

        let completed_id = snowflake::generate(&self.pool).await?;
        self.events
            .emit(EmitEventRequest {
                event_id: completed_id,
                execution_id,
                catalog_id: Some(event.catalog_id),
                event_type: "step_completed".to_string(),
                parent_event_id: Some(event.event_id),
                parent_execution_id: None,
                node_id: event.node_id.clone(),
                node_name: Some(node_name.clone()),
                node_type: Some("step".to_string()),
                status: "COMPLETED".to_string(),
                context: None,
                meta: None,
                result: event.result.clone(),
                worker_id: None,
                attempt: None,
            })
            .await?;

        let playbook = self.load_playbook(event.catalog_id).await?;
        let step = match playbook.get_step(&node_name) {
            Some(s) => s.clone(),
            None => return Ok(()),
        };

        let ctx = context::build_evaluation_context(&self.pool, execution_id, completed_id, event.parent_execution_id)
            .await?
            .to_template_map();
        let envelope = event
            .result
            .clone()
            .unwrap_or_else(|| serde_json::json!({"status": "success", "data": null}));
        let ctx = TemplateRenderer::step_template_context(&ctx, &envelope);

        if let Some(mapping) = &step.result {
            return self
                .complete_execution(execution_id, event.catalog_id, mapping, completed_id, &ctx, &playbook)
                .await;
        }

        let transitions = self.evaluator.evaluate_next_transitions(&step, &ctx)?;

        if transitions.is_empty() {
            if step.next.is_none() {
                // No `next:` and no `result:` mapping: this is an implicit
                // terminal step. Complete with an empty result so the
                // execution doesn't hang.
                return self
                    .complete_execution(execution_id, event.catalog_id, &HashMap::new(), completed_id, &ctx, &playbook)
                    .await;
            }
            return Ok(());
        }

        for transition in transitions {
            let next_name = match &transition.next_step {
                Some(n) => n,
                None => continue,
            };
            let next_step = match playbook.get_step(next_name) {
                Some(s) => s,
                None => continue,
            };
            self.enter_step(
                execution_id,
                event.catalog_id,
                &playbook,
                next_step,
                completed_id,
                &ctx,
                transition.with_params.clone(),
            )
            .await?;
        }

        Ok(())
    }

    /// Render `mapping` against `ctx` and emit `execution_completed`.
    async fn complete_execution(
        &self,
        execution_id: i64,
        catalog_id: i64,
        mapping: &HashMap<String, Value>,
        parent_event_id: i64,
        ctx: &HashMap<String, Value>,
        playbook: &Playbook,
    ) -> AppResult<()> {
        let mut data = serde_json::Map::new();
        for (key, template) in mapping {
            let rendered = self.renderer.render_value(template, ctx)?;
            data.insert(key.clone(), rendered);
        }

        let parent_execution_id = self
            .events
            .get_execution_started_event(execution_id)
            .await?
            .and_then(|e| e.parent_execution_id);

        let event_id = snowflake::generate(&self.pool).await?;
        self.events
            .emit(EmitEventRequest {
                event_id,
                execution_id,
                catalog_id: Some(catalog_id),
                event_type: "execution_completed".to_string(),
                parent_event_id: Some(parent_event_id),
                parent_execution_id,
                node_id: Some("execution".to_string()),
                node_name: Some(playbook.name().to_string()),
                node_type: Some("execution".to_string()),
                status: "COMPLETED".to_string(),
                context: None,
                meta: None,
                result: Some(serde_json::json!({"status": "success", "data": Value::Object(data)})),
                worker_id: None,
                attempt: None,
            })
            .await?;

        Ok(())
    }
}

#[async_trait]
impl EventListener for WorkflowBroker {
    async fn on_event(&self, event: &Event) {
        if let Err(err) = self.route_event(event.event_id).await {
            tracing::error!(
                execution_id = event.execution_id,
                event_id = event.event_id,
                error = %err,
                "broker failed to route event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::types::{NextSpec, NextTarget, ToolKind, ToolSpec};

    fn noop_step(name: &str, next: Option<NextSpec>, result: Option<HashMap<String, Value>>) -> Step {
        Step {
            step: name.to_string(),
            desc: None,
            args: None,
            vars: None,
            r#loop: None,
            tool: ToolSpec {
                kind: ToolKind::Python,
                auth: None,
                libs: None,
                args: None,
                code: Some("return {}".to_string()),
                url: None,
                method: None,
                query: None,
                connection: None,
                extra: HashMap::new(),
            },
            when: None,
            retry: None,
            result,
            save: None,
            next,
        }
    }

    #[test]
    fn test_transitions_drive_every_matched_target() {
        let evaluator = ConditionEvaluator::new();
        let step = noop_step(
            "branch",
            Some(NextSpec::Targets(vec![
                NextTarget {
                    step: "a".to_string(),
                    args: None,
                    data: None,
                    payload: None,
                    with: None,
                    when: None,
                },
                NextTarget {
                    step: "b".to_string(),
                    args: None,
                    data: None,
                    payload: None,
                    with: None,
                    when: None,
                },
            ])),
            None,
        );

        let ctx = HashMap::new();
        let transitions = evaluator.evaluate_next_transitions(&step, &ctx).unwrap();
        assert_eq!(transitions.len(), 2);
    }

    #[test]
    fn test_terminal_step_carries_result_mapping() {
        let mut mapping = HashMap::new();
        mapping.insert("status".to_string(), Value::String("{{ start.status }}".to_string()));
        let step = noop_step("end", None, Some(mapping));
        assert!(step.result.is_some());
        assert!(step.next.is_none());
    }
}
