//! Ollama local-runtime adapter.
//!
//! Talks to `/api/chat` with `stream:false`. Generation parameters move into
//! the `options` map with ollama's names (`max_tokens` -> `num_predict`);
//! image parts attach to their message's `images` array as raw base64.
//! Streaming (NDJSON upstream, not SSE) is refused with `bad-request`.

use serde_json::{json, Map, Value};

use crate::models::{MessageContent, NormalizedRequest, NormalizedResponse, Part, Usage};

use super::{join_url, send_json, AdapterError, InvokeContext};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const CHAT_PATH: &str = "/api/chat";

pub async fn invoke(
    http: &reqwest::Client,
    ctx: &InvokeContext,
    request: &NormalizedRequest,
    key: &str,
) -> Result<NormalizedResponse, AdapterError> {
    let url = join_url(ctx.provider.base_url.as_deref(), DEFAULT_BASE_URL, CHAT_PATH);
    let body = build_body(ctx, request)?;

    let mut builder = http.post(&url).json(&body);
    // A local runtime normally has no key; honor one when configured
    // (e.g. an authenticating reverse proxy in front).
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
    let mut messages = Vec::new();
    for message in request.effective_messages() {
        let mut entry = Map::new();
        entry.insert(
            "role".to_string(),
            Value::String(message.role.as_str().to_string()),
        );
        entry.insert(
            "content".to_string(),
            Value::String(message.content.text_lossy()),
        );

        let images = collect_images(&message.content)?;
        if !images.is_empty() {
            entry.insert("images".to_string(), Value::Array(images));
        }
        messages.push(Value::Object(entry));
    }

    let mut options = Map::new();
    for (key, value) in ctx.effective_params(request) {
        let renamed = match key.as_str() {
            "max_tokens" => "num_predict",
            "presence_penalty" => "presence_penalty",
            "frequency_penalty" => "frequency_penalty",
            "top_p" => "top_p",
            "temperature" => "temperature",
            "stop" => "stop",
            other => other,
        };
        options.insert(renamed.to_string(), value);
    }

    let mut body = Map::new();
    body.insert(
        "model".to_string(),
        Value::String(ctx.model.remote_identifier.clone()),
    );
    body.insert("messages".to_string(), Value::Array(messages));
    body.insert("stream".to_string(), Value::Bool(false));
    if !options.is_empty() {
        body.insert("options".to_string(), Value::Object(options));
    }

    Ok(Value::Object(body))
}

fn collect_images(content: &MessageContent) -> Result<Vec<Value>, AdapterError> {
    let MessageContent::Parts(parts) = content else {
        return Ok(Vec::new());
    };
    let mut images = Vec::new();
    for part in parts {
        match part {
            Part::Text { .. } => {}
            Part::ImageRef { source } => match &source.data {
                Some(data) => images.push(Value::String(data.clone())),
                None => {
                    return Err(AdapterError::BadRequest(
                        "this provider accepts inline image data only".to_string(),
                    ))
                }
            },
            Part::AudioRef { .. } | Part::VideoRef { .. } | Part::FileRef { .. } => {
                return Err(AdapterError::BadRequest(
                    "this provider accepts text and image parts only".to_string(),
                ))
            }
        }
    }
    Ok(images)
}

pub(crate) fn parse_body(raw: &Value) -> Result<NormalizedResponse, AdapterError> {
    let output_text = raw
        .pointer("/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| AdapterError::Upstream("reply carries no message".to_string()))?
        .to_string();

    let usage = Usage {
        prompt_tokens: raw.get("prompt_eval_count").and_then(Value::as_u64),
        completion_tokens: raw.get("eval_count").and_then(Value::as_u64),
        total_tokens: None,
    }
    .with_inferred_total();

    Ok(NormalizedResponse {
        output_text,
        usage: (!usage.is_empty()).then_some(usage),
        cost: None,
        raw: Some(raw.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::request::MediaSource;
    use crate::models::{Message, Model, ModelConfig, Provider, ProviderType, Role};
    use serde_json::json;
    use tokio::time::{Duration, Instant};

    fn ctx() -> InvokeContext {
        InvokeContext {
            provider: Provider {
                name: "local".to_string(),
                provider_type: ProviderType::OllamaLocal,
                base_url: None,
                api_keys: vec![],
                settings: Map::new(),
                is_active: true,
            },
            model: Model {
                provider_name: "local".to_string(),
                model_name: "m1".to_string(),
                display_name: None,
                description: None,
                remote_identifier: "llama3".to_string(),
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

    #[test]
    fn test_max_tokens_renames_to_num_predict() {
        let request = NormalizedRequest {
            prompt: Some("hi".to_string()),
            parameters: json!({"max_tokens": 32, "temperature": 0.5})
                .as_object()
                .unwrap()
                .clone(),
            ..Default::default()
        };
        let body = build_body(&ctx(), &request).unwrap();
        assert_eq!(body["options"]["num_predict"], json!(32));
        assert_eq!(body["options"]["temperature"], json!(0.5));
        assert_eq!(body["stream"], json!(false));
    }

    #[test]
    fn test_inline_images_attach_to_message() {
        let request = NormalizedRequest {
            messages: Some(vec![Message {
                role: Role::User,
                content: MessageContent::Parts(vec![
                    Part::Text {
                        text: "describe".to_string(),
                    },
                    Part::ImageRef {
                        source: MediaSource {
                            url: None,
                            data: Some("aGVsbG8=".to_string()),
                            mime_type: Some("image/png".to_string()),
                        },
                    },
                ]),
            }]),
            ..Default::default()
        };
        let body = build_body(&ctx(), &request).unwrap();
        assert_eq!(body["messages"][0]["content"], json!("describe"));
        assert_eq!(body["messages"][0]["images"], json!(["aGVsbG8="]));
    }

    #[test]
    fn test_url_images_are_refused() {
        let request = NormalizedRequest {
            messages: Some(vec![Message {
                role: Role::User,
                content: MessageContent::Parts(vec![Part::ImageRef {
                    source: MediaSource {
                        url: Some("https://example.com/cat.png".to_string()),
                        data: None,
                        mime_type: None,
                    },
                }]),
            }]),
            ..Default::default()
        };
        assert!(matches!(
            build_body(&ctx(), &request),
            Err(AdapterError::BadRequest(_))
        ));
    }

    #[test]
    fn test_round_trip_ping() {
        let request = NormalizedRequest {
            messages: Some(vec![Message {
                role: Role::User,
                content: MessageContent::Text("ping".to_string()),
            }]),
            parameters: json!({"temperature": 0, "max_tokens": 1})
                .as_object()
                .unwrap()
                .clone(),
            ..Default::default()
        };
        let body = build_body(&ctx(), &request).unwrap();
        assert_eq!(body["model"], json!("llama3"));
        let canned = json!({
            "message": {"role": "assistant", "content": "pong"},
            "prompt_eval_count": 4,
            "eval_count": 2
        });
        let response = parse_body(&canned).unwrap();
        assert_eq!(response.output_text, "pong");
        assert_eq!(response.usage.unwrap().total_tokens, Some(6));
    }
}
