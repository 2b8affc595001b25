use axum::{extract::State, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    providers: usize,
    models: usize,
    records_dropped: u64,
}

/// Liveness endpoint for container health checks, with a few cheap gauges.
///
/// Intentionally avoids touching the stores so periodic probe traffic stays
/// quiet in the logs.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.catalog.snapshot().await;

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        providers: snapshot.providers.len(),
        models: snapshot.models.len(),
        records_dropped: state.recorder.dropped_count(),
    })
}
