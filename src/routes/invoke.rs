use axum::{routing::post, Router};

use crate::{handlers, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/models/{provider}/{model}/invoke",
            post(handlers::invoke::direct),
        )
        .route("/route/invoke", post(handlers::invoke::route))
}
