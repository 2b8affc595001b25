//! Shared fixtures for in-crate tests. Everything here runs without opening
//! a socket: the catalog is static, the invocation store is in-memory, and
//! handler tests drive the router with `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use crate::config::{
    AuthConfig, CorsConfig, LimitsConfig, RecorderConfig, ServerConfig, Settings, StoreConfig,
};
use crate::services::catalog_service::{CredentialRow, ModelRow, ProviderRow};
use crate::services::providers::ProviderDispatcher;
use crate::services::{
    AuthService, CatalogService, InvocationRecorder, MemoryInvocationStore, ModelRateLimiter,
    RouterService, StaticCatalogStore,
};
use crate::AppState;

pub(crate) fn settings(request_timeout_secs: u64) -> Settings {
    Settings {
        server: ServerConfig {
            port: 0,
            host: "127.0.0.1".to_string(),
        },
        stores: StoreConfig {
            catalog_url: String::new(),
            invocations_url: String::new(),
            max_connections: 1,
        },
        auth: AuthConfig {
            session_ttl_hours: 24,
            sweep_interval_secs: 300,
        },
        recorder: RecorderConfig {
            queue_capacity: 64,
            batch_size: 8,
            full_capture: false,
            shutdown_grace_secs: 1,
        },
        limits: LimitsConfig {
            requests_per_minute: 10_000,
            request_timeout_secs,
            body_limit_bytes: 1024 * 1024,
        },
        cors: CorsConfig {
            allowed_origins: vec![],
        },
    }
}

pub(crate) fn provider_row(name: &str, provider_type: &str) -> ProviderRow {
    ProviderRow {
        name: name.to_string(),
        provider_type: provider_type.to_string(),
        // Nothing listens on port 9; adapter calls fail fast with a
        // connection error instead of hanging.
        base_url: Some("http://127.0.0.1:9".to_string()),
        api_keys: r#"["sk-upstream"]"#.to_string(),
        settings: "{}".to_string(),
        is_active: true,
    }
}

pub(crate) fn model_row(provider: &str, name: &str, tags: &str) -> ModelRow {
    ModelRow {
        provider_name: provider.to_string(),
        model_name: name.to_string(),
        display_name: None,
        description: None,
        remote_identifier: None,
        tags: tags.to_string(),
        default_params: "{}".to_string(),
        config: "{}".to_string(),
        rate_limit: None,
        is_active: true,
    }
}

pub(crate) fn credential_row(id: &str, secret: &str) -> CredentialRow {
    CredentialRow {
        id: id.to_string(),
        secret: secret.to_string(),
        is_active: true,
        allowed_models: None,
        allowed_providers: None,
        parameter_limits: None,
    }
}

pub(crate) struct StateFixture {
    pub state: AppState,
    pub invocations: Arc<MemoryInvocationStore>,
}

/// Build a full `AppState` over a static catalog.
pub(crate) async fn state_with(
    providers: Vec<ProviderRow>,
    models: Vec<ModelRow>,
    credentials: Vec<CredentialRow>,
    request_timeout_secs: u64,
) -> StateFixture {
    let catalog = Arc::new(CatalogService::new(Arc::new(StaticCatalogStore {
        providers,
        models,
        credentials,
    })));
    catalog.refresh().await.expect("fixture catalog must load");

    let auth = Arc::new(AuthService::new(catalog.clone(), 24));
    let dispatcher =
        Arc::new(ProviderDispatcher::new(catalog.clone()).expect("client must build"));
    let router = Arc::new(RouterService::new(
        catalog.clone(),
        auth.clone(),
        ModelRateLimiter::new(),
        dispatcher,
    ));

    let settings = settings(request_timeout_secs);
    let invocations = Arc::new(MemoryInvocationStore::default());
    let recorder = Arc::new(InvocationRecorder::spawn(
        invocations.clone(),
        &settings.recorder,
    ));

    StateFixture {
        state: AppState {
            catalog,
            auth,
            router,
            recorder,
            settings: Arc::new(settings),
        },
        invocations,
    }
}
