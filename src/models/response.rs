use serde::{Deserialize, Serialize};

/// Normalized upstream reply.
///
/// `raw` preserves the provider's verbatim response for observability; the
/// adapter strips credential material from it before construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizedResponse {
    pub output_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

/// Token usage as reported upstream. A partial reply that lacks a usage
/// block yields `None` counts, not zeros.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl Usage {
    pub fn is_empty(&self) -> bool {
        self.prompt_tokens.is_none()
            && self.completion_tokens.is_none()
            && self.total_tokens.is_none()
    }

    /// Fill `total_tokens` from the two halves when upstream omitted it.
    pub fn with_inferred_total(mut self) -> Self {
        if self.total_tokens.is_none() {
            if let (Some(p), Some(c)) = (self.prompt_tokens, self.completion_tokens) {
                self.total_tokens = Some(p + c);
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inferred_total_only_when_both_halves_present() {
        let usage = Usage {
            prompt_tokens: Some(3),
            completion_tokens: Some(4),
            total_tokens: None,
        }
        .with_inferred_total();
        assert_eq!(usage.total_tokens, Some(7));

        let partial = Usage {
            prompt_tokens: Some(3),
            completion_tokens: None,
            total_tokens: None,
        }
        .with_inferred_total();
        assert_eq!(partial.total_tokens, None);
    }

    #[test]
    fn test_upstream_total_is_preserved() {
        let usage = Usage {
            prompt_tokens: Some(3),
            completion_tokens: Some(4),
            total_tokens: Some(10),
        }
        .with_inferred_total();
        assert_eq!(usage.total_tokens, Some(10));
    }
}
