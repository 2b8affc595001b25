use axum::{
    routing::{get, post},
    Router,
};

use crate::{handlers, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/chat/completions",
            post(handlers::openai_compat::chat_completions),
        )
        .route("/v1/models", get(handlers::openai_compat::list_models))
}
