use serde::{Deserialize, Serialize};

/// Model record — matches the `models` table in the catalog store.
///
/// Identity is `(provider_name, model_name)`. `remote_identifier` is what the
/// adapter sends upstream; it defaults to `model_name` at snapshot load. The
/// two are kept distinct everywhere: lookups, rate-limit keys, records, and
/// allow-lists always use the local name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub provider_name: String,
    pub model_name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub remote_identifier: String,
    /// Unique, lowercased, treated as a set.
    pub tags: Vec<String>,
    /// Defaults merged under the caller's parameters (caller wins).
    pub default_params: serde_json::Map<String, serde_json::Value>,
    pub config: ModelConfig,
    pub rate_limit: Option<RateLimitConfig>,
    pub is_active: bool,
}

impl Model {
    /// `provider/model` key used for rate limiting and allow-list checks.
    pub fn key(&self) -> String {
        format!("{}/{}", self.provider_name, self.model_name)
    }

    pub fn has_all_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|t| self.tags.iter().any(|m| m == t))
    }
}

/// Capability block from the model's `config` map.
///
/// Costs are per 1k tokens in a fixed currency unit. Unknown keys are
/// preserved in `extra` so configuration sync can round-trip them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    pub context_window: Option<u64>,
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default)]
    pub supports_audio: bool,
    #[serde(default)]
    pub supports_video: bool,
    pub input_cost_per_1k: Option<f64>,
    pub output_cost_per_1k: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ModelConfig {
    /// Cost of a call given token counts. `None` inputs or missing per-1k
    /// rates yield `None`, never zero.
    pub fn cost(&self, prompt_tokens: Option<u64>, completion_tokens: Option<u64>) -> Option<f64> {
        let input_rate = self.input_cost_per_1k?;
        let output_rate = self.output_cost_per_1k?;
        let prompt = prompt_tokens? as f64;
        let completion = completion_tokens? as f64;
        Some((prompt / 1000.0) * input_rate + (completion / 1000.0) * output_rate)
    }
}

/// Token-bucket configuration for a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub per_seconds: u32,
    /// Bucket capacity; must be >= `max_requests` when set.
    pub burst_size: Option<u32>,
}

impl RateLimitConfig {
    pub fn capacity(&self) -> u32 {
        self.burst_size.unwrap_or(self.max_requests)
    }

    /// Refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        f64::from(self.max_requests) / f64::from(self.per_seconds.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_with_tags(tags: &[&str]) -> Model {
        Model {
            provider_name: "p1".to_string(),
            model_name: "m1".to_string(),
            display_name: None,
            description: None,
            remote_identifier: "m1".to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            default_params: serde_json::Map::new(),
            config: ModelConfig::default(),
            rate_limit: None,
            is_active: true,
        }
    }

    #[test]
    fn test_has_all_tags_is_subset_match() {
        let model = model_with_tags(&["chat", "general", "fast"]);
        assert!(model.has_all_tags(&["chat".into()]));
        assert!(model.has_all_tags(&["chat".into(), "fast".into()]));
        assert!(!model.has_all_tags(&["chat".into(), "coding".into()]));
        // Empty query matches everything.
        assert!(model.has_all_tags(&[]));
    }

    #[test]
    fn test_cost_requires_both_rates_and_counts() {
        let mut config = ModelConfig {
            input_cost_per_1k: Some(0.5),
            output_cost_per_1k: Some(1.5),
            ..Default::default()
        };
        assert_eq!(config.cost(Some(2000), Some(1000)), Some(2.5));
        assert_eq!(config.cost(None, Some(1000)), None);
        assert_eq!(config.cost(Some(2000), None), None);

        config.output_cost_per_1k = None;
        assert_eq!(config.cost(Some(2000), Some(1000)), None);
    }

    #[test]
    fn test_rate_limit_capacity_and_rate() {
        let limit = RateLimitConfig {
            max_requests: 10,
            per_seconds: 60,
            burst_size: None,
        };
        assert_eq!(limit.capacity(), 10);
        assert!((limit.rate() - 10.0 / 60.0).abs() < 1e-9);

        let with_burst = RateLimitConfig {
            max_requests: 10,
            per_seconds: 60,
            burst_size: Some(20),
        };
        assert_eq!(with_burst.capacity(), 20);
    }
}
