use chrono::{DateTime, Utc};
use serde::Serialize;

/// In-memory session minted from a credential by a successful login.
///
/// Sessions live only in process memory and do not survive restart. A session
/// may be bound to exactly one `(provider_name, model_name)` pair after
/// creation; a later bind replaces the previous one. Expiry is terminal: an
/// expired session behaves as if it never existed.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    /// Opaque bearer token (256 random bits, hex-encoded). Never logged.
    #[serde(skip_serializing)]
    pub token: String,
    pub credential_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub bound_model: Option<(String, String)>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
