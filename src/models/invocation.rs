use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row in the observability store describing one upstream call.
///
/// Immutable once written. Redaction happens before construction: request
/// headers are never captured, the response text is truncated by the
/// recorder, and credential material never appears in any field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub id: String,
    pub provider_name: String,
    pub model_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: InvocationStatus,
    pub error_message: Option<String>,
    pub request_prompt: Option<String>,
    pub request_messages: Option<serde_json::Value>,
    pub request_parameters: serde_json::Value,
    pub response_text: Option<String>,
    pub response_text_length: Option<i64>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cost: Option<f64>,
    pub raw_response: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Success,
    Error,
}

impl InvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Success => "success",
            InvocationStatus::Error => "error",
        }
    }
}

impl From<&str> for InvocationStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "success" => InvocationStatus::Success,
            _ => InvocationStatus::Error,
        }
    }
}

impl std::fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
