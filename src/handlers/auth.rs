use axum::{
    extract::State,
    http::{header, HeaderMap},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{error::ApiError, extractors::SessionToken, AppState};

// ─── Input Types ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LoginInput {
    pub api_key: Option<String>,
    /// Optional pre-bind target; both fields or neither.
    pub provider_name: Option<String>,
    pub model_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BindModelInput {
    pub provider_name: String,
    pub model_name: String,
}

// ─── Handlers ────────────────────────────────────────────────────────────────

/// `POST /auth/login`: validate a credential secret and mint a session.
///
/// The secret is taken from the request body's `api_key` or from an
/// `Authorization: Bearer` header. This is the one endpoint where body
/// credential material is accepted.
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<LoginInput>,
) -> Result<Json<Value>, ApiError> {
    let secret = input
        .api_key
        .clone()
        .filter(|s| !s.is_empty())
        .or_else(|| bearer_token(&headers))
        .ok_or(ApiError::AuthRequired)?;

    let bind = match (input.provider_name, input.model_name) {
        (Some(provider), Some(model)) => Some((provider, model)),
        (None, None) => None,
        _ => {
            return Err(ApiError::BadRequest(
                "provider_name and model_name must be supplied together".to_string(),
            ))
        }
    };

    let outcome = state.auth.login(&secret, bind).await?;
    Ok(Json(json!({
        "token": outcome.token,
        "expires_in": outcome.expires_in_secs,
        "message": "login successful",
    })))
}

/// `POST /auth/logout`: revoke the presented session.
pub async fn logout(
    State(state): State<AppState>,
    SessionToken(token): SessionToken,
) -> Result<Json<Value>, ApiError> {
    state.auth.logout(&token).await?;
    Ok(Json(json!({ "message": "logged out" })))
}

/// `POST /auth/bind-model`: bind the session to one `(provider, model)`
/// pair. A later bind replaces the previous one.
pub async fn bind_model(
    State(state): State<AppState>,
    SessionToken(token): SessionToken,
    Json(input): Json<BindModelInput>,
) -> Result<Json<Value>, ApiError> {
    state
        .auth
        .bind_model(&token, &input.provider_name, &input.model_name)
        .await?;
    Ok(Json(json!({
        "message": "model bound",
        "provider_name": input.provider_name,
        "model_name": input.model_name,
    })))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;

    use crate::test_support::{credential_row, model_row, provider_row, state_with};

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer sk-abc".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("sk-abc"));

        let mut empty = HeaderMap::new();
        empty.insert(header::AUTHORIZATION, "Basic dXNlcg==".parse().unwrap());
        assert_eq!(bearer_token(&empty), None);
    }

    async fn app() -> (crate::AppState, axum::Router) {
        let fixture = state_with(
            vec![provider_row("p1", "openai-compatible")],
            vec![model_row("p1", "m1", "[]")],
            vec![credential_row("cred-1", "sk-client")],
            5,
        )
        .await;
        let router = axum::Router::new()
            .nest("/auth", crate::routes::auth::routes())
            .with_state(fixture.state.clone());
        (fixture.state, router)
    }

    async fn post_json(
        router: &axum::Router,
        uri: &str,
        body: serde_json::Value,
        bearer: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = builder.body(Body::from(body.to_string())).unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 16)
            .await
            .unwrap();
        let parsed = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, parsed)
    }

    #[tokio::test]
    async fn test_login_bind_logout_flow() {
        let (_state, router) = app().await;

        let (status, body) =
            post_json(&router, "/auth/login", json!({"api_key": "sk-client"}), None).await;
        assert_eq!(status, StatusCode::OK);
        let token = body["token"].as_str().unwrap().to_string();
        assert_eq!(body["expires_in"], json!(24 * 3600));

        let (status, _) = post_json(
            &router,
            "/auth/bind-model",
            json!({"provider_name": "p1", "model_name": "m1"}),
            Some(&token),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = post_json(&router, "/auth/logout", json!({}), Some(&token)).await;
        assert_eq!(status, StatusCode::OK);

        // The session is gone: further use answers 404.
        let (status, _) = post_json(&router, "/auth/logout", json!({}), Some(&token)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_login_with_invalid_secret_is_403() {
        let (_state, router) = app().await;
        let (status, _) =
            post_json(&router, "/auth/login", json!({"api_key": "sk-wrong"}), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_login_without_material_is_401() {
        let (_state, router) = app().await;
        let (status, _) = post_json(&router, "/auth/login", json!({}), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_bind_unknown_model_is_404() {
        let (_state, router) = app().await;
        let (_, body) =
            post_json(&router, "/auth/login", json!({"api_key": "sk-client"}), None).await;
        let token = body["token"].as_str().unwrap().to_string();

        let (status, _) = post_json(
            &router,
            "/auth/bind-model",
            json!({"provider_name": "p1", "model_name": "missing"}),
            Some(&token),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
