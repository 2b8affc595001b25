use std::collections::HashMap;

use serde_json::{Map, Value};

/// Merge model defaults under caller parameters. The caller wins on key
/// collisions.
pub fn merge_params(defaults: &Map<String, Value>, caller: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = defaults.clone();
    for (key, value) in caller {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Apply per-credential upper bounds to numeric parameters.
///
/// Values above the bound are clamped down, never rejected. Non-numeric
/// values and keys without a configured limit pass through untouched. Integer
/// values stay integers after clamping.
pub fn clamp_params(
    mut params: Map<String, Value>,
    limits: &HashMap<String, f64>,
) -> Map<String, Value> {
    for (key, limit) in limits {
        let Some(value) = params.get_mut(key) else {
            continue;
        };
        let Some(current) = value.as_f64() else {
            continue;
        };
        if current > *limit {
            *value = if value.is_u64() || value.is_i64() {
                Value::from(*limit as i64)
            } else {
                Value::from(*limit)
            };
        }
    }
    params
}

/// Full precedence chain: model defaults < caller < credential limits.
pub fn effective_params(
    defaults: &Map<String, Value>,
    caller: &Map<String, Value>,
    limits: Option<&HashMap<String, f64>>,
) -> Map<String, Value> {
    let merged = merge_params(defaults, caller);
    match limits {
        Some(limits) => clamp_params(merged, limits),
        None => merged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_caller_wins_over_defaults() {
        let defaults = map(json!({"temperature": 0.7, "top_p": 0.9}));
        let caller = map(json!({"temperature": 0.1}));
        let merged = merge_params(&defaults, &caller);
        assert_eq!(merged["temperature"], json!(0.1));
        assert_eq!(merged["top_p"], json!(0.9));
    }

    #[test]
    fn test_clamp_lowers_values_above_limit() {
        let params = map(json!({"max_tokens": 2000}));
        let limits = HashMap::from([("max_tokens".to_string(), 500.0)]);
        let clamped = clamp_params(params, &limits);
        assert_eq!(clamped["max_tokens"], json!(500));
    }

    #[test]
    fn test_clamp_passes_values_at_or_below_limit() {
        let params = map(json!({"max_tokens": 100}));
        let limits = HashMap::from([("max_tokens".to_string(), 500.0)]);
        let clamped = clamp_params(params, &limits);
        assert_eq!(clamped["max_tokens"], json!(100));
    }

    #[test]
    fn test_clamp_preserves_float_type() {
        let params = map(json!({"temperature": 1.9}));
        let limits = HashMap::from([("temperature".to_string(), 1.0)]);
        let clamped = clamp_params(params, &limits);
        assert_eq!(clamped["temperature"], json!(1.0));
    }

    #[test]
    fn test_clamp_ignores_non_numeric_values() {
        let params = map(json!({"stop": ["###"]}));
        let limits = HashMap::from([("stop".to_string(), 1.0)]);
        let clamped = clamp_params(params, &limits);
        assert_eq!(clamped["stop"], json!(["###"]));
    }

    #[test]
    fn test_effective_params_full_chain() {
        let defaults = map(json!({"max_tokens": 4096, "temperature": 0.7}));
        let caller = map(json!({"max_tokens": 2000}));
        let limits = HashMap::from([("max_tokens".to_string(), 500.0)]);
        let effective = effective_params(&defaults, &caller, Some(&limits));
        assert_eq!(effective["max_tokens"], json!(500));
        assert_eq!(effective["temperature"], json!(0.7));
    }
}
