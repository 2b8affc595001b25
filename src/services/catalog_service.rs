use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::{
    error::ApiError,
    models::{Credential, Model, Provider, ProviderType, RateLimitConfig},
    utils::token::constant_time_eq,
};

// =========================================================================
// STORE INTERFACE
// =========================================================================

/// Raw provider row as the catalog store hands it over. Secrets may still be
/// `env:NAME` references; resolution happens when the snapshot is built.
#[derive(Debug, Clone)]
pub struct ProviderRow {
    pub name: String,
    pub provider_type: String,
    pub base_url: Option<String>,
    /// JSON array of key strings (inline or `env:NAME`).
    pub api_keys: String,
    /// JSON object.
    pub settings: String,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct ModelRow {
    pub provider_name: String,
    pub model_name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub remote_identifier: Option<String>,
    /// JSON array of tag strings.
    pub tags: String,
    /// JSON object.
    pub default_params: String,
    /// JSON object.
    pub config: String,
    /// JSON object, nullable.
    pub rate_limit: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct CredentialRow {
    pub id: String,
    /// Inline secret or `env:NAME` reference.
    pub secret: String,
    pub is_active: bool,
    /// JSON array, nullable.
    pub allowed_models: Option<String>,
    /// JSON array, nullable.
    pub allowed_providers: Option<String>,
    /// JSON object name -> numeric bound, nullable.
    pub parameter_limits: Option<String>,
}

/// Narrow read interface against the external catalog store. Failures are
/// surfaced verbatim as store-unavailable.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn load_providers(&self) -> anyhow::Result<Vec<ProviderRow>>;
    async fn load_models(&self) -> anyhow::Result<Vec<ModelRow>>;
    async fn load_credentials(&self) -> anyhow::Result<Vec<CredentialRow>>;
}

// =========================================================================
// SNAPSHOT
// =========================================================================

/// Immutable, validated view of the catalog. Swapped wholesale on refresh;
/// snapshots already handed out stay valid (copy-on-read).
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    pub providers: HashMap<String, Provider>,
    /// BTreeMap keyed by `(provider_name, model_name)` so iteration order is
    /// the router's deterministic tie-break order.
    pub models: BTreeMap<(String, String), Model>,
    pub credentials: HashMap<String, Credential>,
}

impl CatalogSnapshot {
    /// Build a validated snapshot from raw rows. Unknown provider types and
    /// malformed JSON columns are configuration errors; a missing environment
    /// variable behind an `env:` secret is not (the key is skipped, or the
    /// credential disabled).
    pub fn from_rows(
        providers: Vec<ProviderRow>,
        models: Vec<ModelRow>,
        credentials: Vec<CredentialRow>,
    ) -> anyhow::Result<Self> {
        let mut snapshot = CatalogSnapshot::default();

        for row in providers {
            let Some(provider_type) = ProviderType::parse(&row.provider_type) else {
                bail!(
                    "provider '{}' has unrecognized type '{}'",
                    row.name,
                    row.provider_type
                );
            };

            let key_refs: Vec<String> = serde_json::from_str(&row.api_keys)
                .with_context(|| format!("provider '{}': invalid api_keys JSON", row.name))?;
            let api_keys = key_refs
                .iter()
                .filter_map(|k| resolve_secret_ref(k))
                .collect();

            let settings = serde_json::from_str(&row.settings)
                .with_context(|| format!("provider '{}': invalid settings JSON", row.name))?;

            snapshot.providers.insert(
                row.name.clone(),
                Provider {
                    name: row.name,
                    provider_type,
                    base_url: row.base_url,
                    api_keys,
                    settings,
                    is_active: row.is_active,
                },
            );
        }

        for row in models {
            let provider = snapshot.providers.get(&row.provider_name).ok_or_else(|| {
                anyhow::anyhow!(
                    "model '{}/{}' references unknown provider",
                    row.provider_name,
                    row.model_name
                )
            })?;
            // Every enabled model must point at an enabled provider of a
            // recognized type. The type check already happened above.
            if row.is_active && !provider.is_active {
                bail!(
                    "active model '{}/{}' points at disabled provider",
                    row.provider_name,
                    row.model_name
                );
            }

            let tags: Vec<String> = match serde_json::from_str::<Vec<String>>(&row.tags) {
                Ok(tags) => normalize_tags(tags),
                Err(e) => bail!(
                    "model '{}/{}': invalid tags JSON: {}",
                    row.provider_name,
                    row.model_name,
                    e
                ),
            };

            let default_params = serde_json::from_str(&row.default_params).with_context(|| {
                format!(
                    "model '{}/{}': invalid default_params JSON",
                    row.provider_name, row.model_name
                )
            })?;
            let config = serde_json::from_str(&row.config).with_context(|| {
                format!(
                    "model '{}/{}': invalid config JSON",
                    row.provider_name, row.model_name
                )
            })?;
            let rate_limit: Option<RateLimitConfig> = match &row.rate_limit {
                Some(raw) => Some(serde_json::from_str(raw).with_context(|| {
                    format!(
                        "model '{}/{}': invalid rate_limit JSON",
                        row.provider_name, row.model_name
                    )
                })?),
                None => None,
            };
            if let Some(limit) = &rate_limit {
                if limit.max_requests == 0 || limit.per_seconds == 0 {
                    bail!(
                        "model '{}/{}': rate_limit requires positive max_requests and per_seconds",
                        row.provider_name,
                        row.model_name
                    );
                }
                if let Some(burst) = limit.burst_size {
                    if burst < limit.max_requests {
                        bail!(
                            "model '{}/{}': burst_size must be >= max_requests",
                            row.provider_name,
                            row.model_name
                        );
                    }
                }
            }

            let remote_identifier = row
                .remote_identifier
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| row.model_name.clone());

            snapshot.models.insert(
                (row.provider_name.clone(), row.model_name.clone()),
                Model {
                    provider_name: row.provider_name,
                    model_name: row.model_name,
                    display_name: row.display_name,
                    description: row.description,
                    remote_identifier,
                    tags,
                    default_params,
                    config,
                    rate_limit,
                    is_active: row.is_active,
                },
            );
        }

        for row in credentials {
            let (secret, resolved) = match resolve_secret_ref(&row.secret) {
                Some(secret) => (secret, true),
                // Missing environment variable: keep the row but disable it.
                None => (String::new(), false),
            };

            let allowed_models: Option<HashSet<String>> = match &row.allowed_models {
                Some(raw) => Some(
                    serde_json::from_str(raw)
                        .with_context(|| format!("credential '{}': invalid allowed_models", row.id))?,
                ),
                None => None,
            };
            let allowed_providers: Option<HashSet<String>> = match &row.allowed_providers {
                Some(raw) => Some(serde_json::from_str(raw).with_context(|| {
                    format!("credential '{}': invalid allowed_providers", row.id)
                })?),
                None => None,
            };
            let parameter_limits: Option<HashMap<String, f64>> = match &row.parameter_limits {
                Some(raw) => Some(serde_json::from_str(raw).with_context(|| {
                    format!("credential '{}': invalid parameter_limits", row.id)
                })?),
                None => None,
            };

            snapshot.credentials.insert(
                row.id.clone(),
                Credential {
                    id: row.id,
                    secret,
                    is_active: row.is_active && resolved,
                    allowed_models,
                    allowed_providers,
                    parameter_limits,
                },
            );
        }

        Ok(snapshot)
    }
}

/// Resolve an inline secret or an `env:NAME` reference. Returns `None` when
/// the referenced environment variable is unset or empty.
fn resolve_secret_ref(raw: &str) -> Option<String> {
    match raw.strip_prefix("env:") {
        Some(var) => std::env::var(var).ok().filter(|v| !v.is_empty()),
        None => {
            if raw.is_empty() {
                None
            } else {
                Some(raw.to_string())
            }
        }
    }
}

fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

// =========================================================================
// SERVICE
// =========================================================================

/// Read-through view of providers, models, and credentials.
///
/// Readers clone out of the current snapshot and must not assume freshness
/// across awaits. `refresh` swaps the snapshot pointer under the write lock;
/// per-provider key-rotation counters live behind the same lock discipline.
pub struct CatalogService {
    store: Arc<dyn CatalogStore>,
    snapshot: RwLock<Arc<CatalogSnapshot>>,
    rotation: RwLock<HashMap<String, usize>>,
}

/// Filter for `list_models`.
#[derive(Debug, Clone, Default)]
pub struct ModelFilter {
    pub provider: Option<String>,
    pub include_inactive: bool,
}

impl CatalogService {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(CatalogSnapshot::default())),
            rotation: RwLock::new(HashMap::new()),
        }
    }

    /// Reload from the underlying store and atomically swap the snapshot.
    /// Snapshots in flight remain valid.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let providers = self.store.load_providers().await?;
        let models = self.store.load_models().await?;
        let credentials = self.store.load_credentials().await?;

        let built = CatalogSnapshot::from_rows(providers, models, credentials)?;
        let provider_count = built.providers.len();
        let model_count = built.models.len();

        *self.snapshot.write().await = Arc::new(built);
        tracing::info!(
            providers = provider_count,
            models = model_count,
            "catalog snapshot refreshed"
        );
        Ok(())
    }

    /// Current snapshot; cheap to clone the Arc, never blocks writers long.
    pub async fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.read().await.clone()
    }

    pub async fn get_provider(&self, name: &str) -> Result<Provider, ApiError> {
        self.snapshot()
            .await
            .providers
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("Provider '{}' not found", name)))
    }

    pub async fn get_model(&self, provider: &str, name: &str) -> Result<Model, ApiError> {
        self.snapshot()
            .await
            .models
            .get(&(provider.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("Model '{}/{}' not found", provider, name)))
    }

    pub async fn list_models(&self, filter: &ModelFilter) -> Vec<Model> {
        let snapshot = self.snapshot().await;
        snapshot
            .models
            .values()
            .filter(|m| filter.include_inactive || m.is_active)
            .filter(|m| {
                filter
                    .provider
                    .as_deref()
                    .map_or(true, |p| m.provider_name == p)
            })
            .cloned()
            .collect()
    }

    /// Find the active credential matching a presented secret.
    ///
    /// Every active credential is compared; the scan does not short-circuit
    /// on the first mismatch, so timing reveals nothing about prefixes.
    pub async fn get_credential_by_secret(&self, secret: &str) -> Option<Credential> {
        let snapshot = self.snapshot().await;
        let mut found = None;
        for credential in snapshot.credentials.values() {
            if !credential.is_active {
                continue;
            }
            if constant_time_eq(&credential.secret, secret) && found.is_none() {
                found = Some(credential.clone());
            }
        }
        found
    }

    pub async fn get_credential_by_id(&self, id: &str) -> Result<Credential, ApiError> {
        self.snapshot()
            .await
            .credentials
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("Credential '{}' not found", id)))
    }

    /// Round-robin index for the provider's upstream key rotation.
    pub async fn next_key_index(&self, provider_name: &str, key_count: usize) -> usize {
        if key_count == 0 {
            return 0;
        }
        let mut rotation = self.rotation.write().await;
        let counter = rotation.entry(provider_name.to_string()).or_insert(0);
        let index = *counter % key_count;
        *counter = counter.wrapping_add(1);
        index
    }
}

// =========================================================================
// STORE IMPLEMENTATIONS
// =========================================================================

/// Catalog store over the embedded SQLite database.
pub struct SqliteCatalogStore {
    pool: SqlitePool,
}

impl SqliteCatalogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SqliteProviderRow {
    name: String,
    provider_type: String,
    base_url: Option<String>,
    api_keys: String,
    settings: String,
    is_active: bool,
}

#[derive(sqlx::FromRow)]
struct SqliteModelRow {
    provider_name: String,
    model_name: String,
    display_name: Option<String>,
    description: Option<String>,
    remote_identifier: Option<String>,
    tags: String,
    default_params: String,
    config: String,
    rate_limit: Option<String>,
    is_active: bool,
}

#[derive(sqlx::FromRow)]
struct SqliteCredentialRow {
    id: String,
    secret: String,
    is_active: bool,
    allowed_models: Option<String>,
    allowed_providers: Option<String>,
    parameter_limits: Option<String>,
}

#[async_trait]
impl CatalogStore for SqliteCatalogStore {
    async fn load_providers(&self) -> anyhow::Result<Vec<ProviderRow>> {
        let rows: Vec<SqliteProviderRow> = sqlx::query_as(
            "SELECT name, provider_type, base_url, api_keys, settings, is_active FROM providers",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ProviderRow {
                name: r.name,
                provider_type: r.provider_type,
                base_url: r.base_url,
                api_keys: r.api_keys,
                settings: r.settings,
                is_active: r.is_active,
            })
            .collect())
    }

    async fn load_models(&self) -> anyhow::Result<Vec<ModelRow>> {
        let rows: Vec<SqliteModelRow> = sqlx::query_as(
            r#"
            SELECT provider_name, model_name, display_name, description,
                   remote_identifier, tags, default_params, config,
                   rate_limit, is_active
            FROM models
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ModelRow {
                provider_name: r.provider_name,
                model_name: r.model_name,
                display_name: r.display_name,
                description: r.description,
                remote_identifier: r.remote_identifier,
                tags: r.tags,
                default_params: r.default_params,
                config: r.config,
                rate_limit: r.rate_limit,
                is_active: r.is_active,
            })
            .collect())
    }

    async fn load_credentials(&self) -> anyhow::Result<Vec<CredentialRow>> {
        let rows: Vec<SqliteCredentialRow> = sqlx::query_as(
            r#"
            SELECT id, secret, is_active, allowed_models, allowed_providers,
                   parameter_limits
            FROM credentials
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| CredentialRow {
                id: r.id,
                secret: r.secret,
                is_active: r.is_active,
                allowed_models: r.allowed_models,
                allowed_providers: r.allowed_providers,
                parameter_limits: r.parameter_limits,
            })
            .collect())
    }
}

/// Fixed-content catalog store for tests and embedded use.
#[derive(Default)]
pub struct StaticCatalogStore {
    pub providers: Vec<ProviderRow>,
    pub models: Vec<ModelRow>,
    pub credentials: Vec<CredentialRow>,
}

#[async_trait]
impl CatalogStore for StaticCatalogStore {
    async fn load_providers(&self) -> anyhow::Result<Vec<ProviderRow>> {
        Ok(self.providers.clone())
    }

    async fn load_models(&self) -> anyhow::Result<Vec<ModelRow>> {
        Ok(self.models.clone())
    }

    async fn load_credentials(&self) -> anyhow::Result<Vec<CredentialRow>> {
        Ok(self.credentials.clone())
    }
}
