//! Local transformers-server adapter.
//!
//! The runtime exposes a flat `/generate` endpoint: one prompt string plus a
//! `parameters` map with transformers' own names (`max_tokens` ->
//! `max_new_tokens`). Chat history is flattened into a role-prefixed
//! transcript. Text only; media parts and streaming are refused.

use serde_json::{json, Map, Value};

use crate::models::{NormalizedRequest, NormalizedResponse, Role, Usage};

use super::{join_url, send_json, AdapterError, InvokeContext};

const DEFAULT_BASE_URL: &str = "http://localhost:8000";
const GENERATE_PATH: &str = "/generate";

pub async fn invoke(
    http: &reqwest::Client,
    ctx: &InvokeContext,
    request: &NormalizedRequest,
    key: &str,
) -> Result<NormalizedResponse, AdapterError> {
    let url = join_url(
        ctx.provider.base_url.as_deref(),
        DEFAULT_BASE_URL,
        GENERATE_PATH,
    );
    let body = build_body(ctx, request)?;

    let mut builder = http.post(&url).json(&body);
    if !key.is_empty() {
        builder = builder.bearer_auth(key);
    }

    let raw = send_json(builder, ctx.deadline).await?;
    let mut response = parse_body(&raw)?;
    response.cost = ctx.model.config.cost(
        response.usage.and_then(|u| u.prompt_tokens),
        response.usage.and_then(|u| u.completion_tokens),
    );
    Ok(response)
}

pub(crate) fn build_body(
    ctx: &InvokeContext,
    request: &NormalizedRequest,
) -> Result<Value, AdapterError> {
    let mut parameters = Map::new();
    for (key, value) in ctx.effective_params(request) {
        let renamed = match key.as_str() {
            "max_tokens" => "max_new_tokens",
            "presence_penalty" | "frequency_penalty" => "repetition_penalty",
            other => other,
        };
        parameters.insert(renamed.to_string(), value);
    }

    Ok(json!({
        "model": ctx.model.remote_identifier,
        "prompt": flatten_messages(request)?,
        "parameters": parameters,
    }))
}

/// Flatten chat history into a role-prefixed transcript ending with the
/// generation cue.
fn flatten_messages(request: &NormalizedRequest) -> Result<String, AdapterError> {
    // A bare prompt passes through untouched.
    if let (Some(prompt), None) = (&request.prompt, &request.messages) {
        return Ok(prompt.clone());
    }

    let mut transcript = String::new();
    for message in request.effective_messages() {
        if message.content.has_media() {
            return Err(AdapterError::BadRequest(
                "this provider accepts text parts only".to_string(),
            ));
        }
        let prefix = match message.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        };
        transcript.push_str(prefix);
        transcript.push_str(": ");
        transcript.push_str(&message.content.text_lossy());
        transcript.push('\n');
    }
    transcript.push_str("Assistant:");
    Ok(transcript)
}

pub(crate) fn parse_body(raw: &Value) -> Result<NormalizedResponse, AdapterError> {
    let output_text = raw
        .get("generated_text")
        .or_else(|| raw.get("text"))
        .and_then(Value::as_str)
        .ok_or_else(|| AdapterError::Upstream("reply carries no generated text".to_string()))?
        .to_string();

    let usage = raw.get("usage").filter(|u| !u.is_null()).map(|block| {
        Usage {
            prompt_tokens: block.get("prompt_tokens").and_then(Value::as_u64),
            completion_tokens: block.get("completion_tokens").and_then(Value::as_u64),
            total_tokens: block.get("total_tokens").and_then(Value::as_u64),
        }
        .with_inferred_total()
    });

    Ok(NormalizedResponse {
        output_text,
        usage: usage.filter(|u| !u.is_empty()),
        cost: None,
        raw: Some(raw.clone()),
    })
}
