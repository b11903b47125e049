//! Context rendering API (C2, SPEC_FULL.md §4.5.c/§6.4).
//!
//! Workers don't hold a replica of `noetl.event` — this endpoint is how a
//! leased worker resolves `{{ step.field }}` references it cannot resolve
//! from the queue entry's own (already-rendered) `context` field: the
//! `save:` directive, whose template context unwraps the primary task's own
//! result envelope and so cannot be rendered until after that task runs
//! (§9 open question 5), and a mode-A iterator's per-item `args`. When
//! `task` is omitted this degrades to a plain context dump, which is what
//! the rest of this endpoint always returned.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::engine::context;
use crate::error::AppError;
use crate::state::AppState;
use crate::template::jinja::TemplateRenderer;

#[derive(Debug, Clone, Deserialize)]
pub struct ContextRenderRequest {
    pub execution_id: i64,
    /// Declared-but-unrendered task fragment (e.g. a step's `save:` block,
    /// or one iteration's `args`) to evaluate against the execution's
    /// current context.
    #[serde(default)]
    pub task: Option<serde_json::Value>,
    /// Result envelope `{status, data, meta?, error?}` of the step whose
    /// output `task` references via `result`/`this`. Only meaningful
    /// together with `task`.
    #[serde(default)]
    pub envelope: Option<serde_json::Value>,
    /// Extra bindings merged over the execution context before rendering —
    /// e.g. a mode-A iterator's `{loop.element: item}` binding for one pass
    /// over `_loop_items`.
    #[serde(default)]
    pub extra: std::collections::HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextRenderResponse {
    pub context: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered: Option<serde_json::Value>,
}

/// POST /api/context/render
pub async fn render(
    State(state): State<AppState>,
    Json(request): Json<ContextRenderRequest>,
) -> Result<Json<ContextRenderResponse>, AppError> {
    let latest = state
        .events
        .get_latest_event(request.execution_id, None)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no events for execution {}", request.execution_id)))?;

    let ctx = context::build_evaluation_context(
        &state.db,
        request.execution_id,
        latest.event_id,
        latest.parent_execution_id,
    )
    .await?;

    let map = ctx.to_template_map();

    let rendered = match &request.task {
        Some(task) => {
            let renderer = TemplateRenderer::new();
            let mut template_map = match &request.envelope {
                Some(envelope) => TemplateRenderer::step_template_context(&map, envelope),
                None => map.clone(),
            };
            template_map.extend(request.extra.clone());
            Some(renderer.render_value(task, &template_map)?)
        }
        None => None,
    };

    let value = serde_json::to_value(map)
        .map_err(|e| AppError::Internal(format!("failed to serialize context: {e}")))?;

    Ok(Json(ContextRenderResponse {
        context: value,
        rendered,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_render_request_parses() {
        let json = r#"{"execution_id": 42}"#;
        let request: ContextRenderRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.execution_id, 42);
        assert!(request.task.is_none());
    }

    #[test]
    fn test_context_render_request_parses_with_task() {
        let json = r#"{"execution_id": 42, "task": {"key": "{{ workload.x }}"}, "envelope": {"status": "success", "data": {"x": 1}}}"#;
        let request: ContextRenderRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.execution_id, 42);
        assert!(request.task.is_some());
        assert!(request.envelope.is_some());
    }
}
