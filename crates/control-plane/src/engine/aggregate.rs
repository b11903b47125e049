//! Result aggregation strategies shared by the retry evaluator's pagination
//! support (SPEC_FULL.md §4.6) and the iterator controller (§4.7).

use serde_json::Value;

/// Unwrap a result envelope `{status, data, meta?, error?}` to its `data`
/// field, matching `template::jinja::TemplateRenderer::step_template_context`.
/// Values that are not envelopes (no `data` key) pass through unchanged.
pub fn envelope_data(envelope: &Value) -> Value {
    match envelope {
        Value::Object(map) if map.contains_key("data") => {
            map.get("data").cloned().unwrap_or(Value::Null)
        }
        other => other.clone(),
    }
}

/// Apply an aggregation strategy (`append` | `extend` | `replace` | `collect`)
/// to a list of unwrapped per-iteration results, in index order.
pub fn aggregate(strategy: &str, items: Vec<Value>) -> Value {
    match strategy {
        "extend" => {
            let mut flat = Vec::new();
            for item in items {
                match item {
                    Value::Array(inner) => flat.extend(inner),
                    other => flat.push(other),
                }
            }
            Value::Array(flat)
        }
        "replace" => items.into_iter().last().unwrap_or(Value::Null),
        "collect" => Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| {
                    serde_json::json!({
                        "index": i,
                        "status": "success",
                        "data": v,
                        "error": Value::Null,
                    })
                })
                .collect(),
        ),
        _ => Value::Array(items),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_data_unwraps() {
        let envelope = serde_json::json!({"status": "success", "data": {"x": 1}});
        assert_eq!(envelope_data(&envelope), serde_json::json!({"x": 1}));
    }

    #[test]
    fn test_envelope_data_passthrough() {
        let raw = serde_json::json!({"x": 1});
        assert_eq!(envelope_data(&raw), raw);
    }

    #[test]
    fn test_aggregate_append_default() {
        let items = vec![serde_json::json!(1), serde_json::json!(2)];
        assert_eq!(aggregate("append", items), serde_json::json!([1, 2]));
    }

    #[test]
    fn test_aggregate_extend_flattens() {
        let items = vec![serde_json::json!([1, 2]), serde_json::json!([3])];
        assert_eq!(aggregate("extend", items), serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn test_aggregate_replace_keeps_last() {
        let items = vec![serde_json::json!(1), serde_json::json!(2)];
        assert_eq!(aggregate("replace", items), serde_json::json!(2));
    }

    #[test]
    fn test_aggregate_collect_wraps_envelopes() {
        let items = vec![serde_json::json!("a")];
        let result = aggregate("collect", items);
        assert_eq!(result[0]["index"], serde_json::json!(0));
        assert_eq!(result[0]["data"], serde_json::json!("a"));
    }
}
