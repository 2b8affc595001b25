use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::time::Instant;

use crate::{
    error::ApiError,
    models::{Model, NormalizedRequest, NormalizedResponse, Provider, ProviderType, Usage},
    services::CatalogService,
};

pub mod anthropic;
pub mod gemini;
pub mod generic;
pub mod ollama;
pub mod openai;
pub mod sse;
pub mod transformers;

/// Upstream failure classification. 5xx and network errors are transient;
/// the adapter itself never retries on them; the classification lets
/// callers decide.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("upstream authentication failed")]
    AuthFailure,
    #[error("upstream resource not found: {0}")]
    NotFound(String),
    #[error("upstream rate limited")]
    RateLimited,
    #[error("upstream timeout")]
    Timeout,
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("network error: {0}")]
    Network(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::Timeout | AdapterError::Upstream(_) | AdapterError::Network(_)
        )
    }

    /// Whether rotating to the provider's next key is worth one retry.
    fn is_key_rotatable(&self) -> bool {
        matches!(self, AdapterError::AuthFailure | AdapterError::RateLimited)
    }
}

impl From<AdapterError> for ApiError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::BadRequest(msg) => ApiError::BadRequest(msg),
            AdapterError::AuthFailure => {
                ApiError::UpstreamError("Upstream authentication failed".to_string())
            }
            AdapterError::NotFound(msg) => {
                ApiError::UpstreamError(format!("Upstream resource not found: {}", msg))
            }
            AdapterError::RateLimited => {
                ApiError::UpstreamError("Upstream provider rate limited".to_string())
            }
            AdapterError::Timeout => ApiError::UpstreamTimeout,
            AdapterError::Upstream(msg) => ApiError::UpstreamError(msg),
            AdapterError::Network(msg) => {
                ApiError::UpstreamError(format!("Network error: {}", msg))
            }
        }
    }
}

/// One element of a streaming reply: text deltas, then a final record
/// carrying whatever usage the upstream reported. The sequence is finite and
/// non-restartable.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Delta(String),
    Done(Option<Usage>),
}

/// Everything an adapter needs for one call. `parameter_limits` are the
/// per-credential clamps resolved by authorization; the merge order is
/// model defaults < caller parameters < clamps.
pub struct InvokeContext {
    pub provider: Provider,
    pub model: Model,
    pub parameter_limits: Option<HashMap<String, f64>>,
    pub deadline: Instant,
}

impl InvokeContext {
    /// Upstream parameter map after the full precedence chain.
    pub fn effective_params(
        &self,
        request: &NormalizedRequest,
    ) -> serde_json::Map<String, serde_json::Value> {
        crate::utils::params::effective_params(
            &self.model.default_params,
            &request.parameters,
            self.parameter_limits.as_ref(),
        )
    }
}

/// Dispatch table over `Provider.type`, plus the shared outbound HTTP client
/// and the per-provider key-rotation counters (held by the catalog).
pub struct ProviderDispatcher {
    http: reqwest::Client,
    catalog: Arc<CatalogService>,
}

impl ProviderDispatcher {
    pub fn new(catalog: Arc<CatalogService>) -> anyhow::Result<Self> {
        // Per-call deadlines are applied per request; the builder only sets
        // the connect timeout so a dead host fails fast.
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self { http, catalog })
    }

    /// Invoke the adapter matching the provider type.
    ///
    /// When the provider carries more than one upstream key, keys round-robin
    /// across calls, and an auth-failure or rate-limited classification
    /// advances to the next key once per call before the error is surfaced.
    pub async fn invoke(
        &self,
        ctx: &InvokeContext,
        request: &NormalizedRequest,
    ) -> Result<NormalizedResponse, AdapterError> {
        let keys = &ctx.provider.api_keys;
        let first = self
            .catalog
            .next_key_index(&ctx.provider.name, keys.len())
            .await;

        let key = keys.get(first).map(String::as_str).unwrap_or("");
        match self.invoke_with_key(ctx, request, key).await {
            Err(err) if err.is_key_rotatable() && keys.len() > 1 => {
                let next = (first + 1) % keys.len();
                tracing::warn!(
                    provider = %ctx.provider.name,
                    "rotating upstream key after {}",
                    err
                );
                self.invoke_with_key(ctx, request, &keys[next]).await
            }
            other => other,
        }
    }

    async fn invoke_with_key(
        &self,
        ctx: &InvokeContext,
        request: &NormalizedRequest,
        key: &str,
    ) -> Result<NormalizedResponse, AdapterError> {
        match ctx.provider.provider_type {
            ProviderType::OpenaiCompatible | ProviderType::VllmLocal => {
                openai::invoke(&self.http, ctx, request, key).await
            }
            ProviderType::Anthropic => anthropic::invoke(&self.http, ctx, request, key).await,
            ProviderType::Gemini => gemini::invoke(&self.http, ctx, request, key).await,
            ProviderType::OllamaLocal => ollama::invoke(&self.http, ctx, request, key).await,
            ProviderType::TransformersLocal => {
                transformers::invoke(&self.http, ctx, request, key).await
            }
            ProviderType::GenericHttp => generic::invoke(&self.http, ctx, request, key).await,
        }
    }

    /// Streaming variant. Support is per-adapter:
    /// - openai-compatible and vllm-local stream natively over SSE;
    /// - anthropic and gemini fall back to a single synchronous yield;
    /// - the remaining local/generic adapters refuse with `bad-request`.
    pub async fn stream_invoke(
        &self,
        ctx: &InvokeContext,
        request: &NormalizedRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent, AdapterError>>, AdapterError> {
        match ctx.provider.provider_type {
            ProviderType::OpenaiCompatible | ProviderType::VllmLocal => {
                let keys = &ctx.provider.api_keys;
                let index = self
                    .catalog
                    .next_key_index(&ctx.provider.name, keys.len())
                    .await;
                let key = keys.get(index).map(String::as_str).unwrap_or("");
                openai::stream_invoke(&self.http, ctx, request, key).await
            }
            ProviderType::Anthropic | ProviderType::Gemini => {
                let response = self.invoke(ctx, request).await?;
                Ok(Box::pin(futures::stream::iter(vec![
                    Ok(StreamEvent::Delta(response.output_text)),
                    Ok(StreamEvent::Done(response.usage)),
                ])))
            }
            ProviderType::OllamaLocal
            | ProviderType::TransformersLocal
            | ProviderType::GenericHttp => Err(AdapterError::BadRequest(format!(
                "provider type '{}' does not support streaming",
                ctx.provider.provider_type
            ))),
        }
    }
}

// =========================================================================
// SHARED HELPERS
// =========================================================================

/// Join the provider base URL (or the adapter default) with a fixed path.
pub(crate) fn join_url(base: Option<&str>, default_base: &str, path: &str) -> String {
    let base = base.unwrap_or(default_base).trim_end_matches('/');
    format!("{}{}", base, path)
}

/// Remaining budget before the deadline; an elapsed deadline is a timeout.
pub(crate) fn remaining(deadline: Instant) -> Result<std::time::Duration, AdapterError> {
    let now = Instant::now();
    if now >= deadline {
        return Err(AdapterError::Timeout);
    }
    Ok(deadline - now)
}

/// Send a JSON request with the deadline applied, classify failures, and
/// parse the reply. Non-2xx statuses are classified from the status code
/// with a body snippet for context; the snippet never contains credential
/// material because requests, not responses, carry the keys.
pub(crate) async fn send_json(
    builder: reqwest::RequestBuilder,
    deadline: Instant,
) -> Result<serde_json::Value, AdapterError> {
    let budget = remaining(deadline)?;
    let response = builder.timeout(budget).send().await.map_err(|e| {
        if e.is_timeout() {
            AdapterError::Timeout
        } else if e.is_connect() || e.is_request() {
            AdapterError::Network(e.to_string())
        } else {
            AdapterError::Upstream(e.to_string())
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &body));
    }

    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| AdapterError::Upstream(format!("invalid upstream JSON: {}", e)))
}

pub(crate) fn classify_status(status: StatusCode, body: &str) -> AdapterError {
    let snippet: String = body.chars().take(300).collect();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AdapterError::AuthFailure,
        StatusCode::NOT_FOUND => AdapterError::NotFound(snippet),
        StatusCode::TOO_MANY_REQUESTS => AdapterError::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => AdapterError::Timeout,
        s if s.is_client_error() => AdapterError::BadRequest(snippet),
        _ => AdapterError::Upstream(format!("upstream returned {}: {}", status, snippet)),
    }
}

/// Walk a dotted path (`choices.0.message.content`) through a JSON value.
pub(crate) fn json_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_url_prefers_provider_base() {
        assert_eq!(
            join_url(Some("https://alt.example/"), "https://api.openai.com", "/v1/x"),
            "https://alt.example/v1/x"
        );
        assert_eq!(
            join_url(None, "https://api.openai.com", "/v1/x"),
            "https://api.openai.com/v1/x"
        );
    }

    #[test]
    fn test_classify_status_kinds() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            AdapterError::AuthFailure
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            AdapterError::RateLimited
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "no model"),
            AdapterError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad field"),
            AdapterError::BadRequest(_)
        ));
        let transient = classify_status(StatusCode::BAD_GATEWAY, "");
        assert!(transient.is_transient());
    }

    #[test]
    fn test_json_path_traverses_objects_and_arrays() {
        let value = json!({"choices": [{"message": {"content": "hi"}}]});
        assert_eq!(
            json_path(&value, "choices.0.message.content"),
            Some(&json!("hi"))
        );
        assert_eq!(json_path(&value, "choices.1"), None);
        assert_eq!(json_path(&value, "missing"), None);
    }
}
