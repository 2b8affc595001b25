use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::get,
    Router,
};

use crate::{
    middleware::{rate_limit::per_ip_rate_limit, resolve_principal_middleware, PerIpRateLimiter},
    AppState,
};

pub mod auth;
mod health;
pub mod invoke;
pub mod openai;

/// Build the API surface.
///
/// ## Auth strategy
///
/// The invocation endpoints (`/models`, `/route`, `/v1`) sit behind
/// `resolve_principal_middleware`, which turns credential material into a
/// `Principal` extension, or rejects with 401/403 before any handler runs.
///
/// The session endpoints under `/auth` are NOT behind that middleware:
/// `login` validates body credentials itself, and `logout`/`bind-model`
/// must answer 404 for unknown tokens rather than the middleware's 403.
///
/// ## Rate limiting
///
/// A blanket per-IP limiter wraps everything; per-model token buckets apply
/// inside the dispatch pipeline on top of it.
pub fn api_routes(state: AppState, blanket_limiter: PerIpRateLimiter) -> Router<AppState> {
    let invocation = Router::new()
        .merge(invoke::routes())
        .merge(openai::routes())
        .layer(from_fn_with_state(
            state.clone(),
            resolve_principal_middleware,
        ));

    let sessions = Router::new().nest("/auth", auth::routes());

    Router::new()
        .merge(invocation)
        .merge(sessions)
        .route("/health", get(health::health_check))
        .layer(from_fn(move |req, next| {
            let limiter = blanket_limiter.clone();
            async move { per_ip_rate_limit(limiter, req, next).await }
        }))
}
