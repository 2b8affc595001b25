use serde::{Deserialize, Serialize};

/// Upstream provider record — matches the `providers` table in the catalog
/// store.
///
/// Providers are created and mutated only by configuration sync; the core
/// consumes read-only snapshots. `api_keys` holds the resolved upstream
/// secrets (after `env:` indirection); entries whose environment variable was
/// missing at snapshot load are dropped rather than surfaced as errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    pub provider_type: ProviderType,
    pub base_url: Option<String>,
    /// Resolved upstream API keys, in rotation order.
    #[serde(skip_serializing)]
    pub api_keys: Vec<String>,
    /// Free-form settings consumed by the matching adapter.
    pub settings: serde_json::Map<String, serde_json::Value>,
    pub is_active: bool,
}

/// Closed set of wire protocols the adapter layer understands.
///
/// An unrecognized type string in the catalog is a configuration error
/// surfaced at snapshot load, not at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderType {
    OpenaiCompatible,
    Anthropic,
    Gemini,
    OllamaLocal,
    VllmLocal,
    TransformersLocal,
    GenericHttp,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::OpenaiCompatible => "openai-compatible",
            ProviderType::Anthropic => "anthropic",
            ProviderType::Gemini => "gemini",
            ProviderType::OllamaLocal => "ollama-local",
            ProviderType::VllmLocal => "vllm-local",
            ProviderType::TransformersLocal => "transformers-local",
            ProviderType::GenericHttp => "generic-http",
        }
    }

    /// Parse a catalog type string. Returns `None` for unknown strings so the
    /// snapshot loader can reject the row with context.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai-compatible" => Some(ProviderType::OpenaiCompatible),
            "anthropic" => Some(ProviderType::Anthropic),
            "gemini" => Some(ProviderType::Gemini),
            "ollama-local" => Some(ProviderType::OllamaLocal),
            "vllm-local" => Some(ProviderType::VllmLocal),
            "transformers-local" => Some(ProviderType::TransformersLocal),
            "generic-http" => Some(ProviderType::GenericHttp),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_type_round_trip() {
        for s in [
            "openai-compatible",
            "anthropic",
            "gemini",
            "ollama-local",
            "vllm-local",
            "transformers-local",
            "generic-http",
        ] {
            let parsed = ProviderType::parse(s).unwrap();
            assert_eq!(parsed.as_str(), s);
        }
    }

    #[test]
    fn test_provider_type_rejects_unknown() {
        assert!(ProviderType::parse("bedrock").is_none());
        assert!(ProviderType::parse("").is_none());
    }

    #[test]
    fn test_provider_type_parse_is_case_insensitive() {
        assert_eq!(
            ProviderType::parse("Anthropic"),
            Some(ProviderType::Anthropic)
        );
    }
}
