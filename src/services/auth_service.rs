use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    error::ApiError,
    models::{Credential, Session},
    services::CatalogService,
    utils::token::generate_session_token,
};

/// What the auth subsystem resolves an incoming request to.
///
/// `AnonymousLocal` is minted only for loopback peers that presented no
/// credential material at all; supplied material is always validated, so a
/// loopback request with a bad key fails instead of degrading to anonymous.
#[derive(Debug, Clone)]
pub enum Principal {
    /// Authenticated directly with a credential secret.
    Credential(Credential),
    /// Authenticated with a session token minted by `login`.
    Session {
        session: Session,
        credential: Credential,
    },
    /// Loopback peer, no credential supplied.
    AnonymousLocal,
}

impl Principal {
    pub fn credential(&self) -> Option<&Credential> {
        match self {
            Principal::Credential(credential) => Some(credential),
            Principal::Session { credential, .. } => Some(credential),
            Principal::AnonymousLocal => None,
        }
    }

    pub fn bound_model(&self) -> Option<&(String, String)> {
        match self {
            Principal::Session { session, .. } => session.bound_model.as_ref(),
            _ => None,
        }
    }
}

pub struct LoginOutcome {
    pub token: String,
    pub expires_in_secs: i64,
}

/// Credential validation, session issuance and lookup, and per-credential
/// policy evaluation.
///
/// Sessions live in a single in-memory map; a background sweeper evicts
/// expired entries. Lifecycle: issued -> bound (optional) -> expired/revoked,
/// and expiry is terminal: an expired token behaves as if it never existed.
pub struct AuthService {
    catalog: Arc<CatalogService>,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    ttl: chrono::Duration,
}

impl AuthService {
    pub fn new(catalog: Arc<CatalogService>, session_ttl_hours: i64) -> Self {
        Self {
            catalog,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            ttl: chrono::Duration::hours(session_ttl_hours.max(1)),
        }
    }

    /// Validate a secret and mint a session, optionally pre-bound to a
    /// `(provider, model)` pair. Invalid secrets fail with `forbidden`.
    pub async fn login(
        &self,
        secret: &str,
        bind: Option<(String, String)>,
    ) -> Result<LoginOutcome, ApiError> {
        let credential = self
            .catalog
            .get_credential_by_secret(secret)
            .await
            .ok_or(ApiError::Forbidden)?;

        if let Some((provider, model)) = &bind {
            // Bind validates the model exists and the credential allows it.
            self.catalog.get_model(provider, model).await?;
            if !credential.allows_model(provider, model) {
                return Err(ApiError::Forbidden);
            }
        }

        let now = Utc::now();
        let session = Session {
            token: generate_session_token(),
            credential_id: credential.id.clone(),
            created_at: now,
            expires_at: now + self.ttl,
            bound_model: bind,
        };
        let token = session.token.clone();
        let expires_in_secs = self.ttl.num_seconds();

        self.sessions.write().await.insert(token.clone(), session);
        tracing::info!(credential_id = %credential.id, "session issued");

        Ok(LoginOutcome {
            token,
            expires_in_secs,
        })
    }

    /// Resolve a live session and its backing credential. Expired sessions
    /// are evicted on the spot and report as unknown.
    pub async fn resolve_session(&self, token: &str) -> Option<(Session, Credential)> {
        let session = {
            let sessions = self.sessions.read().await;
            sessions.get(token).cloned()
        }?;

        if session.is_expired(Utc::now()) {
            self.sessions.write().await.remove(token);
            return None;
        }

        // The credential may have been deactivated or removed since login;
        // the session dies with it.
        let credential = self
            .catalog
            .get_credential_by_id(&session.credential_id)
            .await
            .ok()
            .filter(|c| c.is_active)?;

        Some((session, credential))
    }

    /// Revoke a session. Unknown (or already expired) tokens are a 404.
    pub async fn logout(&self, token: &str) -> Result<(), ApiError> {
        let removed = self.sessions.write().await.remove(token);
        match removed {
            Some(session) if !session.is_expired(Utc::now()) => Ok(()),
            _ => Err(ApiError::NotFound("Session not found".to_string())),
        }
    }

    /// Bind (or re-bind) the session to one `(provider, model)` pair. A
    /// later bind replaces the previous one.
    pub async fn bind_model(
        &self,
        token: &str,
        provider: &str,
        model: &str,
    ) -> Result<(), ApiError> {
        let (_, credential) = self
            .resolve_session(token)
            .await
            .ok_or_else(|| ApiError::NotFound("Session not found".to_string()))?;

        self.catalog.get_model(provider, model).await?;
        if !credential.allows_model(provider, model) {
            return Err(ApiError::Forbidden);
        }

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(token)
            .ok_or_else(|| ApiError::NotFound("Session not found".to_string()))?;
        session.bound_model = Some((provider.to_string(), model.to_string()));
        Ok(())
    }

    /// Policy evaluation for one target model.
    ///
    /// Allow-list violations reject with `forbidden`; parameter limits never
    /// reject; the returned map is applied as upper bounds (clamps) when the
    /// adapter assembles the upstream parameters. `anonymous-local` bypasses
    /// the allow-lists and carries no clamps.
    pub fn authorize(
        &self,
        principal: &Principal,
        provider: &str,
        model: &str,
    ) -> Result<Option<HashMap<String, f64>>, ApiError> {
        match principal.credential() {
            None => Ok(None),
            Some(credential) => {
                if !credential.allows_model(provider, model) {
                    return Err(ApiError::Forbidden);
                }
                Ok(credential.parameter_limits.clone())
            }
        }
    }

    /// Evict expired sessions.
    pub async fn sweep(&self) {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(now));
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!(
                "Session sweep: removed {} expired sessions, {} remaining",
                removed,
                sessions.len()
            );
        }
    }

    /// Spawn a background task that periodically evicts expired sessions.
    pub fn spawn_sweeper_task(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}
