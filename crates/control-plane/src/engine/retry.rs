//! Retry evaluator (C6, SPEC_FULL.md §4.6).
//!
//! First-match `when`/`then` policy evaluation against a failed action, in
//! contrast to the broker's all-match `next:` fan-out (`engine::evaluator`).
//! Retry policies attached to a **successful** completion drive the
//! pagination loop instead: a matched policy with `then.next_call` re-invokes
//! the step and accumulates results via `then.collect` until no policy
//! matches, at which point the accumulated pages are folded into a single
//! `action_completed` so the broker's normal completion path takes over.

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;

use crate::db::models::{CatalogEntryRequest, Event};
use crate::db::queries::event as event_queries;
use crate::db::snowflake;
use crate::db::DbPool;
use crate::engine::aggregate::{aggregate, envelope_data};
use crate::engine::context;
use crate::error::{AppError, AppResult};
use crate::playbook::parser;
use crate::playbook::types::{Playbook, RetryPolicy, RetryThen};
use crate::services::event::EmitEventRequest;
use crate::services::{CatalogService, EventService, QueueService};
use crate::template::TemplateRenderer;

pub struct RetryEvaluator {
    pool: DbPool,
    catalog: CatalogService,
    events: EventService,
    queue: QueueService,
    renderer: TemplateRenderer,
}

impl RetryEvaluator {
    pub fn new(
        pool: DbPool,
        catalog: CatalogService,
        events: EventService,
        queue: QueueService,
    ) -> Self {
        Self {
            pool,
            catalog,
            events,
            queue,
            renderer: TemplateRenderer::new(),
        }
    }

    async fn load_playbook(&self, execution_id: i64) -> AppResult<(Playbook, i64)> {
        let started = self
            .events
            .get_execution_started_event(execution_id)
            .await?
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "execution {execution_id} has no execution_started event"
                ))
            })?;
        let catalog_id = started.catalog_id;
        let entry = self
            .catalog
            .get_resource(CatalogEntryRequest {
                catalog_id: Some(catalog_id.to_string()),
                path: None,
                version: None,
            })
            .await?;
        let playbook = parser::parse_playbook(&entry.content)?;
        Ok((playbook, catalog_id))
    }

    async fn build_context(
        &self,
        execution_id: i64,
        parent_event_id: i64,
    ) -> AppResult<HashMap<String, Value>> {
        let ctx = context::build_evaluation_context(&self.pool, execution_id, parent_event_id, None)
            .await?;
        Ok(ctx.to_template_map())
    }

    /// Find the first retry policy whose `when` guard is truthy against `ctx`.
    fn first_match<'a>(
        &self,
        policies: &'a [RetryPolicy],
        ctx: &HashMap<String, Value>,
    ) -> AppResult<Option<&'a RetryPolicy>> {
        for policy in policies {
            if self.renderer.evaluate_condition(&policy.when, ctx)? {
                return Ok(Some(policy));
            }
        }
        Ok(None)
    }

    /// Route an `action_error`/`action_failed` event per §4.6.
    pub async fn handle(&self, error_event: &Event) -> AppResult<()> {
        let execution_id = error_event.execution_id;
        let node_name = match &error_event.node_name {
            Some(n) => n.clone(),
            None => return Ok(()),
        };

        let (playbook, catalog_id) = self.load_playbook(execution_id).await?;
        let step = playbook.get_step(&node_name).cloned().ok_or_else(|| {
            AppError::Validation(format!(
                "unknown step '{node_name}' referenced by action_error"
            ))
        })?;

        let node_id = format!("{execution_id}:{node_name}");
        let queue_entry = self.queue.get_by_node_id(execution_id, &node_id).await?;
        let attempt = queue_entry
            .as_ref()
            .map(|q| q.attempts)
            .or(error_event.attempt)
            .unwrap_or(1);

        let mut ctx = self.build_context(execution_id, error_event.event_id).await?;
        let envelope = error_event
            .result
            .clone()
            .unwrap_or_else(|| serde_json::json!({"status": "error", "data": null}));
        ctx = crate::template::TemplateRenderer::step_template_context(&ctx, &envelope);
        ctx.insert("error".to_string(), envelope.get("error").cloned().unwrap_or(Value::Null));
        ctx.insert(
            "status_code".to_string(),
            envelope.get("status_code").cloned().unwrap_or(Value::Null),
        );
        ctx.insert("response".to_string(), envelope.clone());
        ctx.insert("attempt".to_string(), serde_json::json!(attempt));

        let policies = step.retry.clone().unwrap_or_default();
        let matched = self.first_match(&policies, &ctx)?;

        match matched {
            Some(policy) if attempt < policy.then.max_attempts => {
                let delay = compute_delay(&policy.then, attempt);
                let available_at = Utc::now() + chrono::Duration::milliseconds((delay * 1000.0) as i64);

                if let Some(q) = &queue_entry {
                    self.queue.reschedule(q.queue_id, available_at).await?;
                }

                let event_id = snowflake::generate(&self.pool).await?;
                self.events
                    .emit(EmitEventRequest {
                        event_id,
                        execution_id,
                        catalog_id: Some(catalog_id),
                        event_type: "step_retry".to_string(),
                        parent_event_id: Some(error_event.event_id),
                        parent_execution_id: error_event.parent_execution_id,
                        node_id: Some(node_id.clone()),
                        node_name: Some(node_name.clone()),
                        node_type: Some("step".to_string()),
                        status: "RETRY".to_string(),
                        context: None,
                        meta: Some(serde_json::json!({
                            "attempt": attempt,
                            "delay_seconds": delay,
                            "available_at": available_at.to_rfc3339(),
                        })),
                        result: None,
                        worker_id: None,
                        attempt: Some(attempt),
                    })
                    .await?;
            }
            _ => {
                if let Some(q) = &queue_entry {
                    self.queue.mark_dead(q.queue_id).await?;
                }

                let exhausted_id = snowflake::generate(&self.pool).await?;
                self.events
                    .emit(EmitEventRequest {
                        event_id: exhausted_id,
                        execution_id,
                        catalog_id: Some(catalog_id),
                        event_type: "step_retry_exhausted".to_string(),
                        parent_event_id: Some(error_event.event_id),
                        parent_execution_id: error_event.parent_execution_id,
                        node_id: Some(node_id.clone()),
                        node_name: Some(node_name.clone()),
                        node_type: Some("step".to_string()),
                        status: "FAILED".to_string(),
                        context: None,
                        meta: Some(serde_json::json!({"attempt": attempt})),
                        result: None,
                        worker_id: None,
                        attempt: Some(attempt),
                    })
                    .await?;

                let terminal_id = snowflake::generate(&self.pool).await?;
                self.events
                    .emit(EmitEventRequest {
                        event_id: terminal_id,
                        execution_id,
                        catalog_id: Some(catalog_id),
                        event_type: "step_failed_terminal".to_string(),
                        parent_event_id: Some(exhausted_id),
                        parent_execution_id: error_event.parent_execution_id,
                        node_id: Some(node_id.clone()),
                        node_name: Some(node_name.clone()),
                        node_type: Some("step".to_string()),
                        status: "FAILED".to_string(),
                        context: None,
                        meta: None,
                        result: error_event.result.clone(),
                        worker_id: None,
                        attempt: Some(attempt),
                    })
                    .await?;

                let parent_execution_id = self
                    .events
                    .get_execution_started_event(execution_id)
                    .await?
                    .and_then(|e| e.parent_execution_id);

                let failed_id = snowflake::generate(&self.pool).await?;
                self.events
                    .emit(EmitEventRequest {
                        event_id: failed_id,
                        execution_id,
                        catalog_id: Some(catalog_id),
                        event_type: "execution_failed".to_string(),
                        parent_event_id: Some(terminal_id),
                        parent_execution_id,
                        node_id: Some("execution".to_string()),
                        node_name: Some(playbook.name().to_string()),
                        node_type: Some("execution".to_string()),
                        status: "FAILED".to_string(),
                        context: None,
                        meta: Some(serde_json::json!({
                            "error": {
                                "kind": "step_failed_terminal",
                                "message": envelope.get("error").cloned().unwrap_or(Value::Null),
                                "failed_step": node_name,
                                "attempts": attempt,
                            }
                        })),
                        result: None,
                        worker_id: None,
                        attempt: None,
                    })
                    .await?;
            }
        }

        Ok(())
    }

    /// After a successful completion, check whether the step's retry
    /// policies drive a pagination continuation. Returns `true` when another
    /// page was enqueued (the broker must not treat the step as complete
    /// yet); `false` once pagination has finished or never applied.
    pub async fn maybe_paginate(&self, execution_id: i64, node_name: &str) -> AppResult<bool> {
        let events = event_queries::get_events_by_step(&self.pool, execution_id, node_name).await?;

        // The fold emitted below is itself an `action_completed` for this
        // node_name, so it would otherwise be picked up as "just another
        // page" the next time `route_event` calls back in here — matching
        // no `next_call` policy again, folding again, forever. It carries
        // `meta.pagination_pages`, which no real per-page completion does;
        // use that to tell the two apart and to make the fold idempotent
        // once it has run.
        let is_fold = |e: &&Event| {
            e.meta
                .as_ref()
                .and_then(|m| m.get("pagination_pages"))
                .is_some()
        };
        if events
            .iter()
            .filter(|e| e.event_type == "action_completed")
            .any(|e| is_fold(&e))
        {
            return Ok(false);
        }
        let pages: Vec<&Event> = events
            .iter()
            .filter(|e| e.event_type == "action_completed")
            .collect();
        if pages.is_empty() {
            return Ok(false);
        }

        let (playbook, catalog_id) = self.load_playbook(execution_id).await?;
        let step = match playbook.get_step(node_name) {
            Some(s) => s,
            None => return Ok(false),
        };
        let policies = match &step.retry {
            Some(p) if !p.is_empty() => p,
            _ => return Ok(false),
        };

        let latest = pages.last().expect("non-empty");
        let envelope = latest
            .result
            .clone()
            .unwrap_or_else(|| serde_json::json!({"status": "success", "data": null}));

        let base_ctx = self.build_context(execution_id, latest.event_id).await?;
        let mut ctx = crate::template::TemplateRenderer::step_template_context(&base_ctx, &envelope);
        ctx.insert("attempt".to_string(), serde_json::json!(pages.len()));

        let matched = self
            .first_match(policies, &ctx)?
            .filter(|p| p.then.next_call.is_some());

        match matched {
            Some(policy) => {
                let next_call_expr = policy.then.next_call.as_ref().unwrap();
                let next_call_value = self.renderer.render_to_value(next_call_expr, &ctx)?;

                let node_id = format!("{execution_id}:{node_name}:p{}", pages.len() + 1);
                let mut context_value =
                    serde_json::to_value(step.args.clone().unwrap_or_default()).unwrap_or(Value::Null);
                if let Value::Object(ref mut map) = context_value {
                    map.insert("next_call".to_string(), next_call_value);
                } else {
                    context_value = serde_json::json!({"next_call": next_call_value});
                }

                let meta = serde_json::json!({
                    "parent_event_id": latest.event_id,
                    "pagination_page": pages.len() + 1,
                });

                self.queue
                    .enqueue(
                        execution_id,
                        catalog_id,
                        &node_id,
                        node_name,
                        &step.tool.kind.to_string(),
                        &context_value,
                        &meta,
                        0,
                        Utc::now(),
                        1,
                    )
                    .await?;

                Ok(true)
            }
            None => {
                if pages.len() > 1 {
                    let strategy = policies
                        .iter()
                        .rev()
                        .find_map(|p| p.then.collect.clone())
                        .unwrap_or_else(|| "append".to_string());
                    let page_data: Vec<Value> = pages
                        .iter()
                        .map(|e| envelope_data(&e.result.clone().unwrap_or(Value::Null)))
                        .collect();
                    let aggregated = aggregate(&strategy, page_data);

                    let event_id = snowflake::generate(&self.pool).await?;
                    self.events
                        .emit(EmitEventRequest {
                            event_id,
                            execution_id,
                            catalog_id: Some(catalog_id),
                            event_type: "action_completed".to_string(),
                            parent_event_id: Some(latest.event_id),
                            parent_execution_id: latest.parent_execution_id,
                            node_id: latest.node_id.clone(),
                            node_name: Some(node_name.to_string()),
                            node_type: Some("step".to_string()),
                            status: "COMPLETED".to_string(),
                            context: None,
                            meta: Some(serde_json::json!({"pagination_pages": pages.len()})),
                            result: Some(serde_json::json!({"status": "success", "data": aggregated})),
                            worker_id: None,
                            attempt: None,
                        })
                        .await?;
                }
                Ok(false)
            }
        }
    }
}

/// `delay = min(initial_delay * backoff_multiplier^(attempt-1), max_delay)`,
/// optionally randomized by `uniform(0.5, 1.5)`.
pub fn compute_delay(then: &RetryThen, attempt: i32) -> f64 {
    let exp = (attempt.max(1) - 1) as i32;
    let raw = then.initial_delay * then.backoff_multiplier.powi(exp);
    let bounded = raw.min(then.max_delay);
    if then.jitter {
        let factor = rand::thread_rng().gen_range(0.5..=1.5);
        bounded * factor
    } else {
        bounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_then(initial: f64, mult: f64, max: f64, jitter: bool) -> RetryThen {
        RetryThen {
            max_attempts: 5,
            initial_delay: initial,
            backoff_multiplier: mult,
            max_delay: max,
            jitter,
            next_call: None,
            collect: None,
            sink: None,
        }
    }

    #[test]
    fn test_compute_delay_exponential() {
        let then = policy_then(1.0, 2.0, 300.0, false);
        assert_eq!(compute_delay(&then, 1), 1.0);
        assert_eq!(compute_delay(&then, 2), 2.0);
        assert_eq!(compute_delay(&then, 3), 4.0);
    }

    #[test]
    fn test_compute_delay_capped_at_max() {
        let then = policy_then(10.0, 3.0, 20.0, false);
        assert_eq!(compute_delay(&then, 5), 20.0);
    }

    #[test]
    fn test_compute_delay_jitter_in_bounds() {
        let then = policy_then(10.0, 1.0, 300.0, true);
        let delay = compute_delay(&then, 1);
        assert!((5.0..=15.0).contains(&delay));
    }
}
