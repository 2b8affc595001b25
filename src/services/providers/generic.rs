//! Generic HTTP adapter.
//!
//! For one-off upstreams that speak none of the known protocols. The
//! provider `settings` map describes the wire shape:
//!
//! - `path`            request path (default `/generate`)
//! - `auth_header`     header carrying the key (default `Authorization`)
//! - `auth_scheme`     value prefix, e.g. `Bearer` (default none)
//! - `model_field`     body field for the remote identifier (default `model`)
//! - `prompt_field`    body field for the flattened prompt (default `prompt`)
//! - `params_field`    body field for the parameter map; empty string inlines
//!                     parameters at the top level (default `parameters`)
//! - `response_path`   dotted path to the reply text (default `output_text`,
//!                     with `text` and `response` as fallbacks)
//!
//! Text only; media parts and streaming are refused.

use serde_json::{Map, Value};

use crate::models::{NormalizedRequest, NormalizedResponse, Usage};

use super::{join_url, json_path, send_json, AdapterError, InvokeContext};

const DEFAULT_BASE_URL: &str = "http://localhost:8080";

pub async fn invoke(
    http: &reqwest::Client,
    ctx: &InvokeContext,
    request: &NormalizedRequest,
    key: &str,
) -> Result<NormalizedResponse, AdapterError> {
    let settings = &ctx.provider.settings;
    let path = setting_str(settings, "path").unwrap_or("/generate");
    let url = join_url(ctx.provider.base_url.as_deref(), DEFAULT_BASE_URL, path);
    let body = build_body(ctx, request)?;

    let mut builder = http.post(&url).json(&body);
    if !key.is_empty() {
        let header = setting_str(settings, "auth_header").unwrap_or("Authorization");
        let value = match setting_str(settings, "auth_scheme") {
            Some(scheme) if !scheme.is_empty() => format!("{} {}", scheme, key),
            _ => key.to_string(),
        };
        builder = builder.header(header, value);
    }

    let raw = send_json(builder, ctx.deadline).await?;
    let mut response = parse_body(ctx, &raw)?;
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
    let settings = &ctx.provider.settings;

    let prompt = match (&request.prompt, &request.messages) {
        (Some(prompt), None) => prompt.clone(),
        _ => {
            let messages = request.effective_messages();
            if messages.iter().any(|m| m.content.has_media()) {
                return Err(AdapterError::BadRequest(
                    "this provider accepts text parts only".to_string(),
                ));
            }
            messages
                .iter()
                .map(|m| format!("{}: {}", m.role, m.content.text_lossy()))
                .collect::<Vec<_>>()
                .join("\n")
        }
    };

    let mut body = Map::new();
    let model_field = setting_str(settings, "model_field").unwrap_or("model");
    if !model_field.is_empty() {
        body.insert(
            model_field.to_string(),
            Value::String(ctx.model.remote_identifier.clone()),
        );
    }
    let prompt_field = setting_str(settings, "prompt_field").unwrap_or("prompt");
    body.insert(prompt_field.to_string(), Value::String(prompt));

    let params = ctx.effective_params(request);
    match setting_str(settings, "params_field").unwrap_or("parameters") {
        "" => body.extend(params),
        field => {
            body.insert(field.to_string(), Value::Object(params));
        }
    }

    Ok(Value::Object(body))
}

pub(crate) fn parse_body(
    ctx: &InvokeContext,
    raw: &Value,
) -> Result<NormalizedResponse, AdapterError> {
    let settings = &ctx.provider.settings;

    let output_text = match setting_str(settings, "response_path") {
        Some(path) => json_path(raw, path).and_then(Value::as_str),
        None => ["output_text", "text", "response"]
            .iter()
            .find_map(|p| json_path(raw, p).and_then(Value::as_str)),
    }
    .ok_or_else(|| AdapterError::Upstream("reply carries no recognizable text".to_string()))?
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

fn setting_str<'a>(settings: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    settings.get(key).and_then(Value::as_str)
}
