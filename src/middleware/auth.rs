use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use crate::{error::ApiError, services::Principal, AppState};

/// Where the credential material was found. Order is the acceptance
/// priority; the first source that yields a value wins.
const HEADER_API_KEY: &str = "x-api-key";
const HEADER_SESSION_TOKEN: &str = "x-session-token";

/// Middleware that resolves each request to a `Principal` and stores it in
/// the request extensions.
///
/// Credential material is accepted, in descending priority, from
/// `Authorization: Bearer`, `X-API-Key`, `X-Session-Token`, the
/// `session_token` query parameter, and the `api_key` query parameter. A
/// presented value is first tried as a session token, then as a credential
/// secret; material that matches neither rejects with 403, including on
/// loopback requests, which are never silently downgraded to anonymous.
///
/// Only a loopback peer that presented nothing at all becomes
/// `anonymous-local`; a remote request without material is a 401.
pub async fn resolve_principal_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let principal = match extract_material(&request) {
        Some(material) => {
            if let Some((session, credential)) = state.auth.resolve_session(&material).await {
                Principal::Session {
                    session,
                    credential,
                }
            } else if let Some(credential) =
                state.catalog.get_credential_by_secret(&material).await
            {
                Principal::Credential(credential)
            } else {
                return Err(ApiError::Forbidden);
            }
        }
        None if is_loopback(&request) => Principal::AnonymousLocal,
        None => return Err(ApiError::AuthRequired),
    };

    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

/// Pull credential material from the request without consuming the body.
pub fn extract_material(request: &Request) -> Option<String> {
    let headers = request.headers();

    if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))
        {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    for header_name in [HEADER_API_KEY, HEADER_SESSION_TOKEN] {
        if let Some(value) = headers.get(header_name).and_then(|v| v.to_str().ok()) {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }

    for param in ["session_token", "api_key"] {
        if let Some(value) = query_param(request, param) {
            return Some(value);
        }
    }

    None
}

/// A request is "local" iff the observed peer address is the loopback
/// interface (127.0.0.0/8 or ::1). Forwarding headers are deliberately
/// ignored here: anything that traversed a proxy is not local.
fn is_loopback(request: &Request) -> bool {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().is_loopback())
        .unwrap_or(false)
}

/// Minimal query-string lookup. Session tokens and API keys are plain
/// URL-safe strings, so no percent-decoding is needed.
fn query_param(request: &Request, name: &str) -> Option<String> {
    let query = request.uri().query()?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some(name) {
            let value = parts.next().unwrap_or("");
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum::{middleware::from_fn_with_state, routing::get, Router};
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::test_support::{credential_row, provider_row, state_with};

    fn request_with(header_name: Option<(&str, &str)>, uri: &str) -> Request {
        let mut builder = HttpRequest::builder().uri(uri);
        if let Some((name, value)) = header_name {
            builder = builder.header(name, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn app_state() -> crate::AppState {
        state_with(
            vec![provider_row("p1", "openai-compatible")],
            vec![],
            vec![credential_row("cred-1", "sk-valid")],
            5,
        )
        .await
        .state
    }

    async fn probe(principal: Principal) -> &'static str {
        match principal {
            Principal::AnonymousLocal => "anonymous",
            Principal::Credential(_) => "credential",
            Principal::Session { .. } => "session",
        }
    }

    async fn probe_status(
        state: crate::AppState,
        peer: &str,
        header_pair: Option<(&str, &str)>,
    ) -> (StatusCode, String) {
        let app = Router::new()
            .route("/probe", get(probe))
            .layer(from_fn_with_state(
                state.clone(),
                resolve_principal_middleware,
            ))
            .with_state(state);

        let mut request = request_with(header_pair, "/probe");
        request
            .extensions_mut()
            .insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));

        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 4096)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&body).to_string())
    }

    #[tokio::test]
    async fn test_loopback_without_credential_is_anonymous() {
        let state = app_state().await;
        let (status, body) = probe_status(state.clone(), "127.0.0.1:9999", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "anonymous");
        state.recorder.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_remote_without_credential_is_401() {
        let state = app_state().await;
        let (status, _) = probe_status(state.clone(), "10.0.0.7:9999", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        state.recorder.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_loopback_with_invalid_credential_is_403_not_bypassed() {
        let state = app_state().await;
        let (status, _) = probe_status(
            state.clone(),
            "127.0.0.1:9999",
            Some(("x-api-key", "sk-wrong")),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        state.recorder.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_valid_credential_resolves_from_any_peer() {
        let state = app_state().await;
        let (status, body) = probe_status(
            state.clone(),
            "10.0.0.7:9999",
            Some(("authorization", "Bearer sk-valid")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "credential");
        state.recorder.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_session_token_resolves_as_session_principal() {
        let state = app_state().await;
        let outcome = state.auth.login("sk-valid", None).await.unwrap();
        let token = format!("Bearer {}", outcome.token);
        let (status, body) = probe_status(
            state.clone(),
            "10.0.0.7:9999",
            Some(("authorization", token.leak())),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "session");
        state.recorder.shutdown(Duration::from_secs(1)).await;
    }

    #[test]
    fn test_bearer_header_wins_over_query() {
        let request = request_with(
            Some(("authorization", "Bearer tok-header")),
            "/x?api_key=tok-query",
        );
        assert_eq!(extract_material(&request).as_deref(), Some("tok-header"));
    }

    #[test]
    fn test_x_api_key_header() {
        let request = request_with(Some(("x-api-key", "sk-1")), "/x");
        assert_eq!(extract_material(&request).as_deref(), Some("sk-1"));
    }

    #[test]
    fn test_session_token_query_beats_api_key_query() {
        let request = request_with(None, "/x?api_key=k&session_token=s");
        assert_eq!(extract_material(&request).as_deref(), Some("s"));
    }

    #[test]
    fn test_no_material_is_none() {
        let request = request_with(None, "/x");
        assert_eq!(extract_material(&request), None);
    }

    #[test]
    fn test_loopback_detection_requires_connect_info() {
        let mut request = request_with(None, "/x");
        assert!(!is_loopback(&request));

        request
            .extensions_mut()
            .insert(ConnectInfo("127.0.0.1:5000".parse::<SocketAddr>().unwrap()));
        assert!(is_loopback(&request));

        let mut remote = request_with(None, "/x");
        remote
            .extensions_mut()
            .insert(ConnectInfo("10.1.2.3:5000".parse::<SocketAddr>().unwrap()));
        assert!(!is_loopback(&remote));
    }

    #[test]
    fn test_ipv6_loopback() {
        let mut request = request_with(None, "/x");
        request
            .extensions_mut()
            .insert(ConnectInfo("[::1]:5000".parse::<SocketAddr>().unwrap()));
        assert!(is_loopback(&request));
    }
}
