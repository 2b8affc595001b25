use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};

use crate::{error::ApiError, services::Principal};

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .ok_or(ApiError::AuthRequired)
    }
}

/// Raw session token for the session-management endpoints.
///
/// These endpoints bypass the principal middleware so an unknown token can
/// answer 404 (not 403): logout and bind must be able to say "no such
/// session". Accepted from `Authorization: Bearer`, `X-Session-Token`, or
/// the `session_token` query parameter.
#[derive(Debug, Clone)]
pub struct SessionToken(pub String);

impl<S> FromRequestParts<S> for SessionToken
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(value) = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        {
            if let Some(token) = value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
            {
                let token = token.trim();
                if !token.is_empty() {
                    return Ok(SessionToken(token.to_string()));
                }
            }
        }

        if let Some(value) = parts
            .headers
            .get("x-session-token")
            .and_then(|v| v.to_str().ok())
        {
            let value = value.trim();
            if !value.is_empty() {
                return Ok(SessionToken(value.to_string()));
            }
        }

        if let Some(query) = parts.uri.query() {
            for pair in query.split('&') {
                let mut kv = pair.splitn(2, '=');
                if kv.next() == Some("session_token") {
                    let value = kv.next().unwrap_or("");
                    if !value.is_empty() {
                        return Ok(SessionToken(value.to_string()));
                    }
                }
            }
        }

        Err(ApiError::AuthRequired)
    }
}
