use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Client credential record — matches the `credentials` table in the catalog
/// store.
///
/// A null/absent restriction field means unrestricted. The plaintext secret
/// is compared only through the digest helpers in `utils::token` and is never
/// logged or written to the invocation store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub is_active: bool,
    /// Allowed `provider/model` keys.
    pub allowed_models: Option<HashSet<String>>,
    pub allowed_providers: Option<HashSet<String>>,
    /// Upper bounds applied to caller-supplied numeric parameters.
    pub parameter_limits: Option<HashMap<String, f64>>,
}

impl Credential {
    pub fn allows_provider(&self, provider: &str) -> bool {
        match &self.allowed_providers {
            Some(allowed) => allowed.contains(provider),
            None => true,
        }
    }

    pub fn allows_model(&self, provider: &str, model: &str) -> bool {
        if !self.allows_provider(provider) {
            return false;
        }
        match &self.allowed_models {
            Some(allowed) => allowed.contains(&format!("{}/{}", provider, model)),
            None => true,
        }
    }
}
