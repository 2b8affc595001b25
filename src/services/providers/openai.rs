//! OpenAI-compatible chat completions adapter.
//!
//! Serves `openai-compatible` providers and `vllm-local` (which exposes the
//! same paths). This wire shape is the lingua franca of the hosted
//! aggregators (deepseek, glm, qwen, kimi, openrouter, grok, ...); pointing
//! `base_url` at any of them is enough. Streams natively over SSE.

use base64::Engine;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Map, Value};

use crate::models::{MessageContent, NormalizedRequest, NormalizedResponse, Part, Usage};

use super::{
    classify_status, join_url, remaining, send_json, sse, AdapterError, InvokeContext, StreamEvent,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const CHAT_PATH: &str = "/v1/chat/completions";

pub async fn invoke(
    http: &reqwest::Client,
    ctx: &InvokeContext,
    request: &NormalizedRequest,
    key: &str,
) -> Result<NormalizedResponse, AdapterError> {
    let url = join_url(ctx.provider.base_url.as_deref(), DEFAULT_BASE_URL, CHAT_PATH);
    let body = build_body(ctx, request, false)?;

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

pub async fn stream_invoke(
    http: &reqwest::Client,
    ctx: &InvokeContext,
    request: &NormalizedRequest,
    key: &str,
) -> Result<BoxStream<'static, Result<StreamEvent, AdapterError>>, AdapterError> {
    let url = join_url(ctx.provider.base_url.as_deref(), DEFAULT_BASE_URL, CHAT_PATH);
    let body = build_body(ctx, request, true)?;
    let budget = remaining(ctx.deadline)?;

    let mut builder = http.post(&url).json(&body).timeout(budget);
    if !key.is_empty() {
        builder = builder.bearer_auth(key);
    }

    let response = builder.send().await.map_err(|e| {
        if e.is_timeout() {
            AdapterError::Timeout
        } else {
            AdapterError::Network(e.to_string())
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &body));
    }

    let mut data = sse::data_events(response.bytes_stream());
    let stream = async_stream::stream! {
        let mut usage: Option<Usage> = None;
        while let Some(event) = data.next().await {
            let payload = match event {
                Ok(payload) => payload,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            if payload == "[DONE]" {
                break;
            }
            let Ok(chunk) = serde_json::from_str::<Value>(&payload) else {
                continue;
            };
            if let Some(block) = chunk.get("usage").filter(|u| !u.is_null()) {
                usage = Some(parse_usage(block));
            }
            if let Some(delta) = chunk
                .pointer("/choices/0/delta/content")
                .and_then(Value::as_str)
            {
                if !delta.is_empty() {
                    yield Ok(StreamEvent::Delta(delta.to_string()));
                }
            }
        }
        yield Ok(StreamEvent::Done(usage));
    };

    Ok(Box::pin(stream))
}

/// Translate the normalized request into the chat-completions schema:
/// messages array with role/content, parameters at the top level, multimodal
/// as typed content parts.
pub(crate) fn build_body(
    ctx: &InvokeContext,
    request: &NormalizedRequest,
    stream: bool,
) -> Result<Value, AdapterError> {
    let mut messages = Vec::new();
    for message in request.effective_messages() {
        messages.push(json!({
            "role": message.role.as_str(),
            "content": translate_content(&message.content)?,
        }));
    }

    let mut body = Map::new();
    body.insert(
        "model".to_string(),
        Value::String(ctx.model.remote_identifier.clone()),
    );
    body.insert("messages".to_string(), Value::Array(messages));
    for (key, value) in ctx.effective_params(request) {
        body.insert(key, value);
    }
    if stream {
        body.insert("stream".to_string(), Value::Bool(true));
        // Ask for the trailing usage chunk so the final stream record can
        // carry token counts.
        body.insert(
            "stream_options".to_string(),
            json!({"include_usage": true}),
        );
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
            let url = if let Some(url) = &source.url {
                url.clone()
            } else if let Some(data) = &source.data {
                // Inline payloads ride as data URLs. Re-encode defensively in
                // case the caller sent raw bytes instead of base64.
                let mime = source.mime_type.as_deref().unwrap_or("image/png");
                match base64::engine::general_purpose::STANDARD.decode(data) {
                    Ok(_) => format!("data:{};base64,{}", mime, data),
                    Err(_) => format!(
                        "data:{};base64,{}",
                        mime,
                        base64::engine::general_purpose::STANDARD.encode(data)
                    ),
                }
            } else {
                return Err(AdapterError::BadRequest(
                    "image part carries neither url nor data".to_string(),
                ));
            };
            Ok(json!({"type": "image_url", "image_url": {"url": url}}))
        }
        Part::AudioRef { .. } | Part::VideoRef { .. } | Part::FileRef { .. } => {
            Err(AdapterError::BadRequest(
                "this provider accepts text and image parts only".to_string(),
            ))
        }
    }
}

/// Extract the assistant text (concatenating multi-part replies), pull the
/// usage block if present, and keep the raw reply.
pub(crate) fn parse_body(raw: &Value) -> Result<NormalizedResponse, AdapterError> {
    let content = raw
        .pointer("/choices/0/message/content")
        .ok_or_else(|| AdapterError::Upstream("reply carries no choices".to_string()))?;

    let output_text = match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        Value::Null => String::new(),
        other => other.to_string(),
    };

    let usage = raw
        .get("usage")
        .filter(|u| !u.is_null())
        .map(parse_usage)
        .filter(|u| !u.is_empty());

    Ok(NormalizedResponse {
        output_text,
        usage,
        cost: None,
        raw: Some(raw.clone()),
    })
}

pub(crate) fn parse_usage(block: &Value) -> Usage {
    Usage {
        prompt_tokens: block.get("prompt_tokens").and_then(Value::as_u64),
        completion_tokens: block.get("completion_tokens").and_then(Value::as_u64),
        total_tokens: block.get("total_tokens").and_then(Value::as_u64),
    }
    .with_inferred_total()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::request::MediaSource;
    use crate::models::{Message, ModelConfig, Provider, ProviderType, Role};
    use serde_json::json;
    use tokio::time::{Duration, Instant};

    fn ctx() -> InvokeContext {
        InvokeContext {
            provider: Provider {
                name: "p1".to_string(),
                provider_type: ProviderType::OpenaiCompatible,
                base_url: None,
                api_keys: vec!["sk-upstream".to_string()],
                settings: Map::new(),
                is_active: true,
            },
            model: crate::models::Model {
                provider_name: "p1".to_string(),
                model_name: "m1".to_string(),
                display_name: None,
                description: None,
                remote_identifier: "gpt-test".to_string(),
                tags: vec![],
                default_params: Map::new(),
                config: ModelConfig::default(),
                rate_limit: None,
                is_active: true,
            },
            parameter_limits: None,
            deadline: Instant::now() + Duration::from_secs(30),
        }
    }

    fn ping_request() -> NormalizedRequest {
        NormalizedRequest {
            messages: Some(vec![Message {
                role: Role::User,
                content: MessageContent::Text("ping".to_string()),
            }]),
            parameters: json!({"temperature": 0, "max_tokens": 1})
                .as_object()
                .unwrap()
                .clone(),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_body_uses_remote_identifier_and_top_level_params() {
        let body = build_body(&ctx(), &ping_request(), false).unwrap();
        assert_eq!(body["model"], json!("gpt-test"));
        assert_eq!(body["messages"][0]["role"], json!("user"));
        assert_eq!(body["messages"][0]["content"], json!("ping"));
        assert_eq!(body["temperature"], json!(0));
        assert_eq!(body["max_tokens"], json!(1));
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_build_body_prompt_becomes_user_message() {
        let request = NormalizedRequest {
            prompt: Some("hi".to_string()),
            ..Default::default()
        };
        let body = build_body(&ctx(), &request, false).unwrap();
        assert_eq!(body["messages"][0]["content"], json!("hi"));
    }

    #[test]
    fn test_build_body_stream_requests_usage_chunk() {
        let body = build_body(&ctx(), &ping_request(), true).unwrap();
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["stream_options"]["include_usage"], json!(true));
    }

    #[test]
    fn test_image_parts_translate_to_image_url() {
        let request = NormalizedRequest {
            messages: Some(vec![Message {
                role: Role::User,
                content: MessageContent::Parts(vec![
                    Part::Text {
                        text: "what is this".to_string(),
                    },
                    Part::ImageRef {
                        source: MediaSource {
                            url: Some("https://example.com/cat.png".to_string()),
                            data: None,
                            mime_type: None,
                        },
                    },
                ]),
            }]),
            ..Default::default()
        };
        let body = build_body(&ctx(), &request, false).unwrap();
        let parts = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], json!("text"));
        assert_eq!(parts[1]["type"], json!("image_url"));
        assert_eq!(
            parts[1]["image_url"]["url"],
            json!("https://example.com/cat.png")
        );
    }

    #[test]
    fn test_inline_image_becomes_data_url() {
        let request = NormalizedRequest {
            messages: Some(vec![Message {
                role: Role::User,
                content: MessageContent::Parts(vec![Part::ImageRef {
                    source: MediaSource {
                        url: None,
                        data: Some("aGVsbG8=".to_string()),
                        mime_type: Some("image/jpeg".to_string()),
                    },
                }]),
            }]),
            ..Default::default()
        };
        let body = build_body(&ctx(), &request, false).unwrap();
        assert_eq!(
            body["messages"][0]["content"][0]["image_url"]["url"],
            json!("data:image/jpeg;base64,aGVsbG8=")
        );
    }

    #[test]
    fn test_audio_parts_are_refused() {
        let request = NormalizedRequest {
            messages: Some(vec![Message {
                role: Role::User,
                content: MessageContent::Parts(vec![Part::AudioRef {
                    source: MediaSource::default(),
                }]),
            }]),
            ..Default::default()
        };
        assert!(matches!(
            build_body(&ctx(), &request, false),
            Err(AdapterError::BadRequest(_))
        ));
    }

    #[test]
    fn test_parse_body_extracts_text_and_usage() {
        let raw = json!({
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"},
                         "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 5, "total_tokens": 8}
        });
        let response = parse_body(&raw).unwrap();
        assert_eq!(response.output_text, "hello");
        let usage = response.usage.unwrap();
        assert_eq!(usage.prompt_tokens, Some(3));
        assert_eq!(usage.total_tokens, Some(8));
        assert!(response.raw.is_some());
    }

    #[test]
    fn test_parse_body_multi_part_content_concatenates() {
        let raw = json!({
            "choices": [{"message": {"content": [
                {"type": "text", "text": "hel"},
                {"type": "text", "text": "lo"}
            ]}}]
        });
        let response = parse_body(&raw).unwrap();
        assert_eq!(response.output_text, "hello");
        // No usage block: counts stay null, not zero.
        assert!(response.usage.is_none());
    }

    #[test]
    fn test_parse_body_without_choices_is_upstream_error() {
        assert!(matches!(
            parse_body(&json!({"error": "nope"})),
            Err(AdapterError::Upstream(_))
        ));
    }

    #[test]
    fn test_round_trip_ping() {
        // The canonical translation check: build the request, feed a canned
        // reply, and the normalized text must equal the canned assistant text.
        let body = build_body(&ctx(), &ping_request(), false).unwrap();
        assert_eq!(body["messages"][0]["content"], json!("ping"));
        let canned = json!({
            "choices": [{"message": {"role": "assistant", "content": "pong"}}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
        });
        let response = parse_body(&canned).unwrap();
        assert_eq!(response.output_text, "pong");
    }
}
