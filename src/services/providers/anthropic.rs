//! Anthropic messages adapter.
//!
//! The system prompt is extracted out of the message list; remaining
//! messages are limited to user/assistant (tool results ride as user turns).
//! `max_tokens` is mandatory upstream, so a default is applied when neither
//! the caller nor the model config supplies one. Streaming falls back to a
//! single synchronous yield (see `ProviderDispatcher::stream_invoke`).

use serde_json::{json, Map, Value};

use crate::models::{MessageContent, NormalizedRequest, NormalizedResponse, Part, Role, Usage};

use super::{join_url, send_json, AdapterError, InvokeContext};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const MESSAGES_PATH: &str = "/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Applied when no max_tokens reaches the adapter from any layer.
const DEFAULT_MAX_TOKENS: u64 = 1024;

pub async fn invoke(
    http: &reqwest::Client,
    ctx: &InvokeContext,
    request: &NormalizedRequest,
    key: &str,
) -> Result<NormalizedResponse, AdapterError> {
    let url = join_url(
        ctx.provider.base_url.as_deref(),
        DEFAULT_BASE_URL,
        MESSAGES_PATH,
    );
    let body = build_body(ctx, request)?;

    let builder = http
        .post(&url)
        .header("x-api-key", key)
        .header("anthropic-version", API_VERSION)
        .json(&body);

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
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages = Vec::new();

    for message in request.effective_messages() {
        match message.role {
            Role::System => system_parts.push(message.content.text_lossy()),
            Role::Assistant => messages.push(json!({
                "role": "assistant",
                "content": translate_content(&message.content)?,
            })),
            // Tool results have no first-class slot in this normalized
            // shape; they ride as user turns.
            Role::User | Role::Tool => messages.push(json!({
                "role": "user",
                "content": translate_content(&message.content)?,
            })),
        }
    }

    let mut body = Map::new();
    body.insert(
        "model".to_string(),
        Value::String(ctx.model.remote_identifier.clone()),
    );
    body.insert("messages".to_string(), Value::Array(messages));
    if !system_parts.is_empty() {
        body.insert("system".to_string(), Value::String(system_parts.join("\n")));
    }

    let mut max_tokens_set = false;
    for (key, value) in ctx.effective_params(request) {
        match key.as_str() {
            "max_tokens" => {
                max_tokens_set = true;
                body.insert(key, value);
            }
            // Stop sequences have their own name here.
            "stop" => {
                let sequences = match value {
                    Value::String(s) => Value::Array(vec![Value::String(s)]),
                    other => other,
                };
                body.insert("stop_sequences".to_string(), sequences);
            }
            // Not part of the messages schema.
            "presence_penalty" | "frequency_penalty" => {}
            _ => {
                body.insert(key, value);
            }
        }
    }
    if !max_tokens_set {
        body.insert("max_tokens".to_string(), Value::from(DEFAULT_MAX_TOKENS));
    }

    Ok(Value::Object(body))
}

fn translate_content(content: &MessageContent) -> Result<Value, AdapterError> {
    match content {
        MessageContent::Text(text) => Ok(Value::String(text.clone())),
        MessageContent::Parts(parts) => {
            let mut out = Vec::with_capacity(parts.len());
            for part in parts {
                out.push(translate_part(part)?);
            }
            Ok(Value::Array(out))
        }
    }
}

fn translate_part(part: &Part) -> Result<Value, AdapterError> {
    match part {
        Part::Text { text } => Ok(json!({"type": "text", "text": text})),
        Part::ImageRef { source } => {
            if let Some(url) = &source.url {
                Ok(json!({
                    "type": "image",
                    "source": {"type": "url", "url": url},
                }))
            } else if let Some(data) = &source.data {
                let mime = source.mime_type.as_deref().unwrap_or("image/png");
                Ok(json!({
                    "type": "image",
                    "source": {"type": "base64", "media_type": mime, "data": data},
                }))
            } else {
                Err(AdapterError::BadRequest(
                    "image part carries neither url nor data".to_string(),
                ))
            }
        }
        Part::AudioRef { .. } | Part::VideoRef { .. } | Part::FileRef { .. } => {
            Err(AdapterError::BadRequest(
                "this provider accepts text and image parts only".to_string(),
            ))
        }
    }
}

pub(crate) fn parse_body(raw: &Value) -> Result<NormalizedResponse, AdapterError> {
    let content = raw
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| AdapterError::Upstream("reply carries no content".to_string()))?;

    let output_text = content
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");

    let usage = raw.get("usage").filter(|u| !u.is_null()).map(|block| {
        Usage {
            prompt_tokens: block.get("input_tokens").and_then(Value::as_u64),
            completion_tokens: block.get("output_tokens").and_then(Value::as_u64),
            total_tokens: None,
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
