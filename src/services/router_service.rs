use std::sync::Arc;

use futures::stream::BoxStream;
use serde::Deserialize;
use tokio::time::Instant;

use crate::{
    error::ApiError,
    models::{Model, NormalizedRequest, NormalizedResponse},
    services::{
        providers::{InvokeContext, ProviderDispatcher, StreamEvent},
        AuthService, CatalogService, ModelRateLimiter, Principal,
    },
};

/// Tag-routed selection query.
///
/// Tags are opaque lowercase strings with set semantics; an empty tag list
/// matches every model. `provider_types` filters on the adapter family when
/// non-empty.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteQuery {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub provider_types: Vec<String>,
    #[serde(default)]
    pub include_inactive: bool,
}

impl RouteQuery {
    fn normalized_tags(&self) -> Vec<String> {
        self.tags.iter().map(|t| t.trim().to_lowercase()).collect()
    }
}

/// Strategy for picking one model out of the candidate set. Lexicographic
/// order of `(provider_name, model_name)` is the reproducible default;
/// weighted selection would slot in as a second variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RouteStrategy {
    #[default]
    Lexicographic,
}

/// Model selection and dispatch.
///
/// Two modes: direct (the caller names `(provider, model)`, selection is
/// skipped) and tag-routed. Either way dispatch goes through the per-model
/// rate limiter before the provider adapter.
pub struct RouterService {
    catalog: Arc<CatalogService>,
    auth: Arc<AuthService>,
    limiter: ModelRateLimiter,
    dispatcher: Arc<ProviderDispatcher>,
    strategy: RouteStrategy,
}

impl RouterService {
    pub fn new(
        catalog: Arc<CatalogService>,
        auth: Arc<AuthService>,
        limiter: ModelRateLimiter,
        dispatcher: Arc<ProviderDispatcher>,
    ) -> Self {
        Self {
            catalog,
            auth,
            limiter,
            dispatcher,
            strategy: RouteStrategy::default(),
        }
    }

    /// Tag-routed selection. A model survives iff it is active (unless
    /// `include_inactive`), its provider is active, the query tags are a
    /// subset of its tags, its provider type passes the filter, and the
    /// calling principal's credential permits it. The winner is the
    /// lexicographic minimum of the survivors; an empty set is `no-candidate`.
    pub async fn select(
        &self,
        query: &RouteQuery,
        principal: &Principal,
    ) -> Result<Model, ApiError> {
        let snapshot = self.catalog.snapshot().await;
        let tags = query.normalized_tags();
        let credential = principal.credential();

        // Snapshot models iterate in (provider_name, model_name) order, so
        // the first survivor is already the deterministic pick.
        let selected = snapshot
            .models
            .values()
            .filter(|m| query.include_inactive || m.is_active)
            .filter(|m| {
                snapshot
                    .providers
                    .get(&m.provider_name)
                    .is_some_and(|p| p.is_active)
            })
            .filter(|m| m.has_all_tags(&tags))
            .filter(|m| {
                query.provider_types.is_empty()
                    || snapshot
                        .providers
                        .get(&m.provider_name)
                        .is_some_and(|p| {
                            query
                                .provider_types
                                .iter()
                                .any(|t| t == p.provider_type.as_str())
                        })
            })
            .find(|m| {
                credential.map_or(true, |c| c.allows_model(&m.provider_name, &m.model_name))
            });

        match (selected, self.strategy) {
            (Some(model), RouteStrategy::Lexicographic) => Ok(model.clone()),
            (None, _) => Err(ApiError::NotFound(
                "No candidate model matches the query".to_string(),
            )),
        }
    }

    /// Resolve a direct-mode target. Inactive models are not served.
    pub async fn resolve_direct(&self, provider: &str, model: &str) -> Result<Model, ApiError> {
        let resolved = self.catalog.get_model(provider, model).await?;
        if !resolved.is_active {
            return Err(ApiError::NotFound(format!(
                "Model '{}/{}' not found",
                provider, model
            )));
        }
        let provider = self.catalog.get_provider(&resolved.provider_name).await?;
        if !provider.is_active {
            return Err(ApiError::NotFound(format!(
                "Model '{}/{}' not found",
                resolved.provider_name, resolved.model_name
            )));
        }
        Ok(resolved)
    }

    /// Authorize, acquire a rate token, and invoke the adapter.
    pub async fn dispatch(
        &self,
        model: &Model,
        principal: &Principal,
        request: &NormalizedRequest,
        deadline: Instant,
    ) -> Result<NormalizedResponse, ApiError> {
        let ctx = self.invoke_context(model, principal, deadline).await?;
        self.acquire(model, deadline).await?;
        Ok(self.dispatcher.invoke(&ctx, request).await?)
    }

    /// Streaming variant of `dispatch`.
    pub async fn dispatch_stream(
        &self,
        model: &Model,
        principal: &Principal,
        request: &NormalizedRequest,
        deadline: Instant,
    ) -> Result<BoxStream<'static, Result<StreamEvent, super::providers::AdapterError>>, ApiError>
    {
        let ctx = self.invoke_context(model, principal, deadline).await?;
        self.acquire(model, deadline).await?;
        Ok(self.dispatcher.stream_invoke(&ctx, request).await?)
    }

    async fn invoke_context(
        &self,
        model: &Model,
        principal: &Principal,
        deadline: Instant,
    ) -> Result<InvokeContext, ApiError> {
        let parameter_limits =
            self.auth
                .authorize(principal, &model.provider_name, &model.model_name)?;
        let provider = self.catalog.get_provider(&model.provider_name).await?;
        Ok(InvokeContext {
            provider,
            model: model.clone(),
            parameter_limits,
            deadline,
        })
    }

    async fn acquire(&self, model: &Model, deadline: Instant) -> Result<(), ApiError> {
        match &model.rate_limit {
            Some(config) => self.limiter.acquire(&model.key(), config, deadline).await,
            // Models without a rate_limit bypass the limiter entirely.
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::catalog_service::{CredentialRow, ModelRow, ProviderRow};
    use crate::services::StaticCatalogStore;

    fn provider(name: &str, provider_type: &str, active: bool) -> ProviderRow {
        ProviderRow {
            name: name.to_string(),
            provider_type: provider_type.to_string(),
            base_url: None,
            api_keys: "[]".to_string(),
            settings: "{}".to_string(),
            is_active: active,
        }
    }

    fn model(provider: &str, name: &str, tags: &str, active: bool) -> ModelRow {
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
            is_active: active,
        }
    }

    async fn router(
        providers: Vec<ProviderRow>,
        models: Vec<ModelRow>,
        credentials: Vec<CredentialRow>,
    ) -> (Arc<CatalogService>, RouterService) {
        let catalog = Arc::new(CatalogService::new(Arc::new(StaticCatalogStore {
            providers,
            models,
            credentials,
        })));
        catalog.refresh().await.unwrap();
        let auth = Arc::new(AuthService::new(catalog.clone(), 24));
        let dispatcher = Arc::new(ProviderDispatcher::new(catalog.clone()).unwrap());
        let router = RouterService::new(
            catalog.clone(),
            auth,
            ModelRateLimiter::new(),
            dispatcher,
        );
        (catalog, router)
    }

    fn query(tags: &[&str]) -> RouteQuery {
        RouteQuery {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_tag_subset_match() {
        let (_, router) = router(
            vec![provider("p1", "openai-compatible", true)],
            vec![
                model("p1", "m1", r#"["chat","general"]"#, true),
                model("p1", "m2", r#"["coding"]"#, true),
            ],
            vec![],
        )
        .await;

        let selected = router
            .select(&query(&["chat"]), &Principal::AnonymousLocal)
            .await
            .unwrap();
        assert_eq!(selected.model_name, "m1");

        // Both tags required: no model has them together.
        let err = router
            .select(&query(&["coding", "chat"]), &Principal::AnonymousLocal)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_tag_order_does_not_change_result() {
        let (_, router) = router(
            vec![provider("p1", "openai-compatible", true)],
            vec![model("p1", "m1", r#"["chat","fast","general"]"#, true)],
            vec![],
        )
        .await;

        let a = router
            .select(&query(&["fast", "chat"]), &Principal::AnonymousLocal)
            .await
            .unwrap();
        let b = router
            .select(&query(&["chat", "fast"]), &Principal::AnonymousLocal)
            .await
            .unwrap();
        assert_eq!(a.model_name, b.model_name);
    }

    #[tokio::test]
    async fn test_empty_tag_query_matches_everything() {
        let (_, router) = router(
            vec![provider("p1", "openai-compatible", true)],
            vec![model("p1", "m1", "[]", true)],
            vec![],
        )
        .await;
        assert!(router
            .select(&query(&[]), &Principal::AnonymousLocal)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_inactive_models_and_providers_are_dropped() {
        let (_, router) = router(
            vec![
                provider("p1", "openai-compatible", true),
                provider("p2", "openai-compatible", false),
            ],
            vec![
                model("p1", "m-off", r#"["chat"]"#, false),
                model("p2", "m-dark", r#"["chat"]"#, false),
            ],
            vec![],
        )
        .await;

        assert!(router
            .select(&query(&["chat"]), &Principal::AnonymousLocal)
            .await
            .is_err());

        // include_inactive resurrects inactive models, but not models whose
        // provider is inactive.
        let q = RouteQuery {
            tags: vec!["chat".to_string()],
            include_inactive: true,
            ..Default::default()
        };
        let selected = router.select(&q, &Principal::AnonymousLocal).await.unwrap();
        assert_eq!(selected.model_name, "m-off");
    }

    #[tokio::test]
    async fn test_provider_type_filter() {
        let (_, router) = router(
            vec![
                provider("a", "anthropic", true),
                provider("o", "openai-compatible", true),
            ],
            vec![
                model("a", "m1", r#"["chat"]"#, true),
                model("o", "m2", r#"["chat"]"#, true),
            ],
            vec![],
        )
        .await;

        let q = RouteQuery {
            tags: vec!["chat".to_string()],
            provider_types: vec!["openai-compatible".to_string()],
            ..Default::default()
        };
        let selected = router.select(&q, &Principal::AnonymousLocal).await.unwrap();
        assert_eq!(selected.provider_name, "o");
    }

    #[tokio::test]
    async fn test_selection_is_lexicographic_min() {
        let (_, router) = router(
            vec![
                provider("pa", "openai-compatible", true),
                provider("pb", "openai-compatible", true),
            ],
            vec![
                model("pb", "m1", r#"["chat"]"#, true),
                model("pa", "m9", r#"["chat"]"#, true),
                model("pa", "m2", r#"["chat"]"#, true),
            ],
            vec![],
        )
        .await;

        let selected = router
            .select(&query(&["chat"]), &Principal::AnonymousLocal)
            .await
            .unwrap();
        assert_eq!((selected.provider_name.as_str(), selected.model_name.as_str()), ("pa", "m2"));
    }

    #[tokio::test]
    async fn test_credential_allow_list_filters_candidates() {
        let (catalog, router) = router(
            vec![provider("p1", "openai-compatible", true), provider("p2", "openai-compatible", true)],
            vec![
                model("p1", "m1", r#"["chat"]"#, true),
                model("p2", "m2", r#"["chat"]"#, true),
            ],
            vec![CredentialRow {
                id: "cred-restricted".to_string(),
                secret: "sk-restricted".to_string(),
                is_active: true,
                allowed_models: Some(r#"["p2/m2"]"#.to_string()),
                allowed_providers: None,
                parameter_limits: None,
            }],
        )
        .await;

        let credential = catalog
            .get_credential_by_secret("sk-restricted")
            .await
            .unwrap();
        let principal = Principal::Credential(credential);

        // p1/m1 sorts first but the allow-list forbids it.
        let selected = router.select(&query(&["chat"]), &principal).await.unwrap();
        assert_eq!(selected.model_name, "m2");
    }

    #[tokio::test]
    async fn test_resolve_direct_hides_inactive_targets() {
        let (_, router) = router(
            vec![provider("p1", "openai-compatible", true)],
            vec![
                model("p1", "m1", "[]", true),
                model("p1", "m-off", "[]", false),
            ],
            vec![],
        )
        .await;

        assert!(router.resolve_direct("p1", "m1").await.is_ok());
        assert!(matches!(
            router.resolve_direct("p1", "m-off").await,
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(
            router.resolve_direct("p1", "missing").await,
            Err(ApiError::NotFound(_))
        ));
    }
}
