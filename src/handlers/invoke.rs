use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::time::{Duration, Instant};

use crate::{
    error::ApiError,
    models::{Model, NormalizedRequest, NormalizedResponse},
    services::{providers::StreamEvent, Principal, RouteQuery},
    AppState,
};

// ─── Input Types ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RouteInvokeInput {
    #[serde(default)]
    pub query: RouteQuery,
    pub request: NormalizedRequest,
}

// ─── Handlers ────────────────────────────────────────────────────────────────

/// Direct invocation: the caller names `(provider, model)`, selection is
/// skipped, and the pipeline is authorize -> rate limit -> adapter.
pub async fn direct(
    State(state): State<AppState>,
    principal: Principal,
    Path((provider, model)): Path<(String, String)>,
    Json(request): Json<NormalizedRequest>,
) -> Result<Response, ApiError> {
    request.validate().map_err(ApiError::BadRequest)?;
    let model = state.router.resolve_direct(&provider, &model).await?;
    run_invocation(state, principal, model, request).await
}

/// Tag-routed invocation: the router picks the model from the query's tag
/// and provider-type filters before the same pipeline runs.
pub async fn route(
    State(state): State<AppState>,
    principal: Principal,
    Json(input): Json<RouteInvokeInput>,
) -> Result<Response, ApiError> {
    input.request.validate().map_err(ApiError::BadRequest)?;
    let model = state.router.select(&input.query, &principal).await?;
    tracing::debug!(
        provider = %model.provider_name,
        model = %model.model_name,
        "tag query routed"
    );
    run_invocation(state, principal, model, input.request).await
}

// ─── Shared pipeline ─────────────────────────────────────────────────────────

/// Deadline for one call: the client's `timeout_ms` when supplied, capped by
/// the server default.
pub(crate) fn call_deadline(state: &AppState, request: &NormalizedRequest) -> Instant {
    let server_budget = Duration::from_secs(state.settings.limits.request_timeout_secs);
    let budget = request
        .timeout_ms
        .map(Duration::from_millis)
        .map_or(server_budget, |requested| requested.min(server_budget));
    Instant::now() + budget
}

async fn run_invocation(
    state: AppState,
    principal: Principal,
    model: Model,
    request: NormalizedRequest,
) -> Result<Response, ApiError> {
    let deadline = call_deadline(&state, &request);

    if request.stream {
        return stream_invocation(state, principal, model, request, deadline).await;
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
            Ok(Json(response).into_response())
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

/// Stream text deltas as SSE. Events are `{"delta": ...}` followed by one
/// final `{"done": true, usage?, cost?}`; the invocation record is enqueued
/// when the upstream stream finishes.
async fn stream_invocation(
    state: AppState,
    principal: Principal,
    model: Model,
    request: NormalizedRequest,
    deadline: Instant,
) -> Result<Response, ApiError> {
    let started_at = Utc::now();
    let mut upstream = state
        .router
        .dispatch_stream(&model, &principal, &request, deadline)
        .await?;

    let stream = async_stream::stream! {
        let mut collected = String::new();

        while let Some(event) = upstream.next().await {
            match event {
                Ok(StreamEvent::Delta(delta)) => {
                    collected.push_str(&delta);
                    yield Ok::<_, std::convert::Infallible>(
                        Event::default().data(json!({"delta": delta}).to_string()),
                    );
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

                    yield Ok(Event::default().data(
                        json!({"done": true, "usage": usage, "cost": cost}).to_string(),
                    ));
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
                        json!({"error": err.to_string()}).to_string(),
                    ));
                    return;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response())
}
