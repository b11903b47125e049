//! Condition evaluation for the broker's `next:` transitions.
//!
//! This evaluator implements ONLY the broker's all-match (inclusive) fan-out
//! (SPEC_FULL.md §12.2): every target whose `when` guard matches is taken.
//! First-match `when`/`then` retry policy evaluation is a separate concern —
//! see `engine::retry` — and intentionally does not share a mode switch with
//! this evaluator. A step's `next:` and its `retry:` policy are evaluated
//! by different code, at different times, for different purposes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::playbook::types::{NextSpec, Step};
use crate::template::TemplateRenderer;

/// Result of evaluating a single `next` target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Whether the guard evaluated to true (or was absent).
    pub matched: bool,
    /// The next step to transition to (if matched).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
    /// Parameters to pass to the next step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub with_params: Option<serde_json::Value>,
    /// Error message if evaluation failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EvaluationResult {
    pub fn matched(next_step: &str, with_params: Option<serde_json::Value>) -> Self {
        Self {
            matched: true,
            next_step: Some(next_step.to_string()),
            with_params,
            error: None,
        }
    }

    pub fn not_matched() -> Self {
        Self {
            matched: false,
            next_step: None,
            with_params: None,
            error: None,
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            matched: false,
            next_step: None,
            with_params: None,
            error: Some(message.to_string()),
        }
    }
}

/// Evaluator for a step's `next:` transitions and `when:` pre-execution guard.
pub struct ConditionEvaluator {
    renderer: TemplateRenderer,
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self {
            renderer: TemplateRenderer::new(),
        }
    }

    /// Evaluate a simple condition expression.
    pub fn evaluate_condition(
        &self,
        condition: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> AppResult<bool> {
        self.renderer.evaluate_condition(condition, context)
    }

    /// Evaluate step enable guard (`step.when`). No guard means the step
    /// always runs.
    pub fn evaluate_step_when(
        &self,
        step: &Step,
        context: &HashMap<String, serde_json::Value>,
    ) -> AppResult<bool> {
        match &step.when {
            Some(when_expr) => self.evaluate_condition(when_expr, context),
            None => Ok(true),
        }
    }

    /// Evaluate all `next:` targets, inclusive fan-out: every target whose
    /// `when` guard matches (or carries no guard) is returned as matched.
    /// There is no exclusive/first-match mode here — that lives in
    /// `engine::retry` for the retry policy's `retry:` rules only.
    pub fn evaluate_next_transitions(
        &self,
        step: &Step,
        context: &HashMap<String, serde_json::Value>,
    ) -> AppResult<Vec<EvaluationResult>> {
        let mut results = Vec::new();

        match &step.next {
            Some(NextSpec::Single(next_step)) => {
                results.push(EvaluationResult::matched(next_step, None));
            }
            Some(NextSpec::List(next_steps)) => {
                for next_step in next_steps {
                    results.push(EvaluationResult::matched(next_step, None));
                }
            }
            Some(NextSpec::Targets(targets)) => {
                for target in targets {
                    let should_transition = match &target.when {
                        Some(when_expr) => self.evaluate_condition(when_expr, context)?,
                        None => true,
                    };

                    if should_transition {
                        let overlay = target.merged_overlay();
                        let with_params = if overlay.is_empty() {
                            None
                        } else {
                            Some(serde_json::to_value(&overlay).unwrap_or(serde_json::Value::Null))
                        };
                        results.push(EvaluationResult::matched(&target.step, with_params));
                    }
                }
            }
            None => {}
        }

        Ok(results)
    }

    /// Alias kept for call sites that evaluate structural + conditional
    /// `next:` together; both are the same inclusive evaluation.
    pub fn evaluate_next(
        &self,
        step: &Step,
        context: &HashMap<String, serde_json::Value>,
    ) -> AppResult<Vec<EvaluationResult>> {
        self.evaluate_next_transitions(step, context)
    }

    /// Evaluate a loop collection expression, rendering to a JSON array.
    pub fn evaluate_loop(
        &self,
        loop_expr: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> AppResult<Vec<serde_json::Value>> {
        let value = self.renderer.render_to_value(loop_expr, context)?;

        match value {
            serde_json::Value::Array(arr) => Ok(arr),
            serde_json::Value::Object(map) => Ok(map
                .into_iter()
                .map(|(k, v)| serde_json::json!({"key": k, "value": v}))
                .collect()),
            serde_json::Value::String(s) => {
                if let Ok(arr) = serde_json::from_str::<Vec<serde_json::Value>>(&s) {
                    Ok(arr)
                } else {
                    Ok(s.split([',', '\n'])
                        .map(|item| serde_json::Value::String(item.trim().to_string()))
                        .filter(|v| !v.as_str().unwrap_or("").is_empty())
                        .collect())
                }
            }
            serde_json::Value::Number(n) => {
                let n = n.as_u64().unwrap_or(0) as usize;
                Ok((0..n).map(|i| serde_json::json!(i)).collect())
            }
            _ => Err(crate::error::AppError::Validation(format!(
                "Loop expression did not evaluate to an iterable: {}",
                loop_expr
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_simple_condition() {
        let evaluator = ConditionEvaluator::new();
        let mut context = HashMap::new();
        context.insert("status".to_string(), serde_json::json!("success"));
        context.insert("count".to_string(), serde_json::json!(5));

        assert!(evaluator
            .evaluate_condition("status == 'success'", &context)
            .unwrap());
        assert!(!evaluator
            .evaluate_condition("status == 'failed'", &context)
            .unwrap());
        assert!(evaluator.evaluate_condition("count > 3", &context).unwrap());
        assert!(!evaluator
            .evaluate_condition("count > 10", &context)
            .unwrap());
    }

    #[test]
    fn test_evaluate_loop_array() {
        let evaluator = ConditionEvaluator::new();
        let mut context = HashMap::new();
        context.insert("items".to_string(), serde_json::json!(["a", "b", "c"]));

        let result = evaluator.evaluate_loop("{{ items }}", &context).unwrap();
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn test_evaluate_loop_number() {
        let evaluator = ConditionEvaluator::new();
        let mut context = HashMap::new();
        context.insert("count".to_string(), serde_json::json!(5));

        let result = evaluator.evaluate_loop("{{ count }}", &context).unwrap();
        assert_eq!(result.len(), 5);
    }

    #[test]
    fn test_evaluation_result_serialization() {
        let result =
            EvaluationResult::matched("next_step", Some(serde_json::json!({"key": "value"})));
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("next_step"));
        assert!(json.contains("matched"));
    }

    #[test]
    fn test_evaluation_result_not_matched() {
        let result = EvaluationResult::not_matched();
        assert!(!result.matched);
        assert!(result.next_step.is_none());
    }

    #[test]
    fn test_evaluation_result_error() {
        let result = EvaluationResult::error("something went wrong");
        assert!(!result.matched);
        assert_eq!(result.error, Some("something went wrong".to_string()));
    }

    #[test]
    fn test_next_targets_are_all_evaluated_inclusively() {
        use crate::playbook::types::{NextTarget, ToolKind, ToolSpec};

        let step = Step {
            step: "branch".to_string(),
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
            result: None,
            save: None,
            next: Some(NextSpec::Targets(vec![
                NextTarget {
                    step: "notify".to_string(),
                    args: None,
                    data: None,
                    payload: None,
                    with: None,
                    when: None,
                },
                NextTarget {
                    step: "archive".to_string(),
                    args: None,
                    data: None,
                    payload: None,
                    with: None,
                    when: None,
                },
            ])),
        };

        let evaluator = ConditionEvaluator::new();
        let context = HashMap::new();
        let results = evaluator.evaluate_next_transitions(&step, &context).unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.matched));
    }
}
