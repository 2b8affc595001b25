//! Gemini generateContent adapter.
//!
//! The wire shape is a `contents` array of `parts`; the assistant role is
//! renamed to `model`, system messages become the `systemInstruction` block,
//! and generation parameters are separated into `generationConfig` with
//! camelCase names. Inline media parts carry an explicit mime type, which
//! makes this the one adapter that accepts audio and video parts. The key
//! travels in the `x-goog-api-key` header, never in the URL, so raw captures
//! cannot leak it. Streaming falls back to a single synchronous yield.

use serde_json::{json, Map, Value};

use crate::models::{MessageContent, NormalizedRequest, NormalizedResponse, Part, Role, Usage};

use super::{join_url, send_json, AdapterError, InvokeContext};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub async fn invoke(
    http: &reqwest::Client,
    ctx: &InvokeContext,
    request: &NormalizedRequest,
    key: &str,
) -> Result<NormalizedResponse, AdapterError> {
    let path = format!(
        "/v1beta/models/{}:generateContent",
        ctx.model.remote_identifier
    );
    let url = join_url(ctx.provider.base_url.as_deref(), DEFAULT_BASE_URL, &path);
    let body = build_body(ctx, request)?;

    let builder = http.post(&url).header("x-goog-api-key", key).json(&body);

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
    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents = Vec::new();

    for message in request.effective_messages() {
        let parts = translate_content(&message.content)?;
        match message.role {
            Role::System => system_parts.extend(parts),
            Role::Assistant => contents.push(json!({"role": "model", "parts": parts})),
            Role::User | Role::Tool => contents.push(json!({"role": "user", "parts": parts})),
        }
    }

    let mut body = Map::new();
    body.insert("contents".to_string(), Value::Array(contents));
    if !system_parts.is_empty() {
        body.insert(
            "systemInstruction".to_string(),
            json!({"parts": system_parts}),
        );
    }

    let mut generation_config = Map::new();
    for (key, value) in ctx.effective_params(request) {
        let renamed = match key.as_str() {
            "temperature" => "temperature".to_string(),
            "top_p" => "topP".to_string(),
            "max_tokens" => "maxOutputTokens".to_string(),
            "presence_penalty" => "presencePenalty".to_string(),
            "frequency_penalty" => "frequencyPenalty".to_string(),
            "stop" => {
                let sequences = match value {
                    Value::String(s) => Value::Array(vec![Value::String(s)]),
                    other => other,
                };
                generation_config.insert("stopSequences".to_string(), sequences);
                continue;
            }
            other => other.to_string(),
        };
        generation_config.insert(renamed, value);
    }
    if !generation_config.is_empty() {
        body.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );
    }

    Ok(Value::Object(body))
}

fn translate_content(content: &MessageContent) -> Result<Vec<Value>, AdapterError> {
    match content {
        MessageContent::Text(text) => Ok(vec![json!({"text": text})]),
        MessageContent::Parts(parts) => parts.iter().map(translate_part).collect(),
    }
}

fn translate_part(part: &Part) -> Result<Value, AdapterError> {
    match part {
        Part::Text { text } => Ok(json!({"text": text})),
        Part::ImageRef { source }
        | Part::AudioRef { source }
        | Part::VideoRef { source }
        | Part::FileRef { source } => {
            if let Some(data) = &source.data {
                let mime = source.mime_type.as_deref().ok_or_else(|| {
                    AdapterError::BadRequest(
                        "inline media parts require a mime_type".to_string(),
                    )
                })?;
                Ok(json!({"inline_data": {"mime_type": mime, "data": data}}))
            } else if let Some(url) = &source.url {
                let mut file_data = Map::new();
                file_data.insert("file_uri".to_string(), Value::String(url.clone()));
                if let Some(mime) = &source.mime_type {
                    file_data.insert("mime_type".to_string(), Value::String(mime.clone()));
                }
                Ok(json!({"file_data": file_data}))
            } else {
                Err(AdapterError::BadRequest(
                    "media part carries neither url nor data".to_string(),
                ))
            }
        }
    }
}

pub(crate) fn parse_body(raw: &Value) -> Result<NormalizedResponse, AdapterError> {
    let parts = raw
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| AdapterError::Upstream("reply carries no candidates".to_string()))?;

    let output_text = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");

    let usage = raw
        .get("usageMetadata")
        .filter(|u| !u.is_null())
        .map(|block| {
            Usage {
                prompt_tokens: block.get("promptTokenCount").and_then(Value::as_u64),
                completion_tokens: block.get("candidatesTokenCount").and_then(Value::as_u64),
                total_tokens: block.get("totalTokenCount").and_then(Value::as_u64),
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
