use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    error::ApiError,
    models::{
        Message, MessageContent, Model, NormalizedRequest, NormalizedResponse, Part, Role, Usage,
    },
    models::request::MediaSource,
    services::{providers::StreamEvent, ModelFilter, Principal},
    AppState,
};

use super::invoke::call_deadline;

// ─── Input Types ─────────────────────────────────────────────────────────────

/// OpenAI-shim request body. Everything beyond the addressed fields flows
/// into the normalized parameter map untouched (temperature, top_p,
/// max_tokens, stop, n, penalties, user, and arbitrary pass-throughs).
#[derive(Debug, Deserialize)]
pub struct ChatCompletionInput {
    pub model: String,
    pub messages: Vec<Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub parameters: Map<String, Value>,
}

// ─── Handlers ────────────────────────────────────────────────────────────────

/// `POST /v1/chat/completions`: OpenAI-compatible shim.
///
/// The `model` field is `provider/model`, or a bare model name when a bound
/// session supplies the provider.
pub async fn chat_completions(
    State(state): State<AppState>,
    principal: Principal,
    Json(input): Json<ChatCompletionInput>,
) -> Result<Response, ApiError> {
    if input.messages.is_empty() {
        return Err(ApiError::BadRequest("messages must not be empty".to_string()));
    }

    let (provider, model_name) = resolve_target(&input.model, &principal)?;
    let model = state.router.resolve_direct(&provider, &model_name).await?;
    let model_echo = input.model.clone();

    let messages = input
        .messages
        .iter()
        .map(convert_message)
        .collect::<Result<Vec<_>, _>>()?;

    let request = NormalizedRequest {
        prompt: None,
        messages: Some(messages),
        parameters: input.parameters,
        stream: input.stream,
        timeout_ms: None,
    };

    let deadline = call_deadline(&state, &request);
    if input.stream {
        return stream_chat_completion(state, principal, model, request, model_echo, deadline)
            .await;
    }

    let started_at = Utc::now();
    let result = state
        .router
        .dispatch(&model, &principal, &request, deadline)
        .await;
    let completed_at = Utc::now();

    match result {
        Ok(response) => {
            let record = state.recorder.build_record(
                &model,
                &request,
                Ok(&response),
                started_at,
                completed_at,
            );
            state.recorder.record(record);
            Ok(Json(completion_body(&model_echo, &response)).into_response())
        }
        Err(err) => {
            let record = state.recorder.build_record(
                &model,
                &request,
                Err(&err.to_string()),
                started_at,
                completed_at,
            );
            state.recorder.record(record);
            Err(err)
        }
    }
}

/// `GET /v1/models`: expose the active catalog to OpenAI-style clients.
pub async fn list_models(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<Value>, ApiError> {
    let models = state.catalog.list_models(&ModelFilter::default()).await;
    let snapshot = state.catalog.snapshot().await;
    let credential = principal.credential();

    let data: Vec<Value> = models
        .iter()
        .filter(|m| {
            snapshot
                .providers
                .get(&m.provider_name)
                .is_some_and(|p| p.is_active)
        })
        .filter(|m| {
            credential.map_or(true, |c| c.allows_model(&m.provider_name, &m.model_name))
        })
        .map(|m| {
            json!({
                "id": m.key(),
                "object": "model",
                "owned_by": m.provider_name,
            })
        })
        .collect();

    Ok(Json(json!({"object": "list", "data": data})))
}

// ─── Wire translation ────────────────────────────────────────────────────────

/// Resolve the shim's `model` field to a catalog address.
fn resolve_target(field: &str, principal: &Principal) -> Result<(String, String), ApiError> {
    if let Some((provider, model)) = field.split_once('/') {
        if provider.is_empty() || model.is_empty() {
            return Err(ApiError::BadRequest(format!("Invalid model '{}'", field)));
        }
        return Ok((provider.to_string(), model.to_string()));
    }
    if let Some((provider, _)) = principal.bound_model() {
        return Ok((provider.clone(), field.to_string()));
    }
    Err(ApiError::BadRequest(
        "model must be 'provider/model' unless a bound session supplies the provider".to_string(),
    ))
}

fn parse_role(raw: &str) -> Result<Role, ApiError> {
    match raw {
        "system" => Ok(Role::System),
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        "tool" => Ok(Role::Tool),
        other => Err(ApiError::BadRequest(format!("Unknown role '{}'", other))),
    }
}

/// Convert one OpenAI-wire message into the normalized shape.
fn convert_message(raw: &Value) -> Result<Message, ApiError> {
    let role = raw
        .get("role")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::BadRequest("message missing role".to_string()))
        .and_then(parse_role)?;

    let content = match raw.get("content") {
        Some(Value::String(text)) => MessageContent::Text(text.clone()),
        Some(Value::Array(parts)) => MessageContent::Parts(
            parts
                .iter()
                .map(convert_part)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Some(Value::Null) | None => MessageContent::Text(String::new()),
        Some(other) => {
            return Err(ApiError::BadRequest(format!(
                "unsupported content shape: {}",
                other
            )))
        }
    };

    Ok(Message { role, content })
}

fn convert_part(raw: &Value) -> Result<Part, ApiError> {
    match raw.get("type").and_then(Value::as_str) {
        Some("text") => Ok(Part::Text {
            text: raw
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        Some("image_url") => {
            let url = raw
                .pointer("/image_url/url")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ApiError::BadRequest("image_url part missing url".to_string())
                })?;
            Ok(Part::ImageRef {
                source: split_data_url(url),
            })
        }
        Some("input_audio") => {
            let data = raw
                .pointer("/input_audio/data")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ApiError::BadRequest("input_audio part missing data".to_string())
                })?;
            let format = raw
                .pointer("/input_audio/format")
                .and_then(Value::as_str)
                .unwrap_or("wav");
            Ok(Part::AudioRef {
                source: MediaSource {
                    url: None,
                    data: Some(data.to_string()),
                    mime_type: Some(format!("audio/{}", format)),
                },
            })
        }
        Some(other) => Err(ApiError::BadRequest(format!(
            "unsupported content part type '{}'",
            other
        ))),
        None => Err(ApiError::BadRequest("content part missing type".to_string())),
    }
}

/// A `data:` URL turns back into an inline payload; anything else stays a
/// remote reference.
fn split_data_url(url: &str) -> MediaSource {
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((mime, data)) = rest.split_once(";base64,") {
            return MediaSource {
                url: None,
                data: Some(data.to_string()),
                mime_type: Some(mime.to_string()),
            };
        }
    }
    MediaSource {
        url: Some(url.to_string()),
        data: None,
        mime_type: None,
    }
}

fn usage_block(usage: Option<Usage>, cost: Option<f64>) -> Value {
    let usage = usage.unwrap_or_default();
    json!({
        "prompt_tokens": usage.prompt_tokens,
        "completion_tokens": usage.completion_tokens,
        "total_tokens": usage.total_tokens,
        "cost": cost,
    })
}

fn completion_body(model_echo: &str, response: &NormalizedResponse) -> Value {
    json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model_echo,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": response.output_text},
            "finish_reason": "stop",
        }],
        "usage": usage_block(response.usage, response.cost),
    })
}

fn chunk_body(id: &str, created: i64, model_echo: &str, delta: Value, finish: Option<&str>) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model_echo,
        "choices": [{"index": 0, "delta": delta, "finish_reason": finish}],
    })
}

async fn stream_chat_completion(
    state: AppState,
    principal: Principal,
    model: Model,
    request: NormalizedRequest,
    model_echo: String,
    deadline: Instant,
) -> Result<Response, ApiError> {
    let started_at = Utc::now();
    let mut upstream = state
        .router
        .dispatch_stream(&model, &principal, &request, deadline)
        .await?;

    let id = format!("chatcmpl-{}", Uuid::new_v4().simple());
    let created = Utc::now().timestamp();

    let stream = async_stream::stream! {
        let mut collected = String::new();

        yield Ok::<_, std::convert::Infallible>(Event::default().data(
            chunk_body(&id, created, &model_echo, json!({"role": "assistant"}), None)
                .to_string(),
        ));

        while let Some(event) = upstream.next().await {
            match event {
                Ok(StreamEvent::Delta(delta)) => {
                    collected.push_str(&delta);
                    yield Ok(Event::default().data(
                        chunk_body(&id, created, &model_echo, json!({"content": delta}), None)
                            .to_string(),
                    ));
                }
                Ok(StreamEvent::Done(usage)) => {
                    let usage = usage.map(|u| u.with_inferred_total());
                    let cost = model.config.cost(
                        usage.and_then(|u| u.prompt_tokens),
                        usage.and_then(|u| u.completion_tokens),
                    );
                    let response = NormalizedResponse {
                        output_text: collected.clone(),
                        usage,
                        cost,
                        raw: None,
                    };
                    let record = state.recorder.build_record(
                        &model,
                        &request,
                        Ok(&response),
                        started_at,
                        Utc::now(),
                    );
                    state.recorder.record(record);

                    let mut done = chunk_body(&id, created, &model_echo, json!({}), Some("stop"));
                    done["usage"] = usage_block(usage, cost);
                    yield Ok(Event::default().data(done.to_string()));
                    yield Ok(Event::default().data("[DONE]"));
                    return;
                }
                Err(err) => {
                    let record = state.recorder.build_record(
                        &model,
                        &request,
                        Err(&err.to_string()),
                        started_at,
                        Utc::now(),
                    );
                    state.recorder.record(record);

                    yield Ok(Event::default().data(
                        json!({"error": {"message": err.to_string()}}).to_string(),
                    ));
                    yield Ok(Event::default().data("[DONE]"));
                    return;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
}
