use axum::http::{header, Method};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{limit::RequestBodyLimitLayer, cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llm_gateway::config::Settings;
use llm_gateway::middleware::{request_id_middleware, PerIpRateLimiter};
use llm_gateway::services::{
    providers::ProviderDispatcher, AuthService, CatalogService, InvocationRecorder,
    ModelRateLimiter, RouterService, SqliteCatalogStore, SqliteInvocationStore,
};
use llm_gateway::{routes, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_gateway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let settings = Arc::new(Settings::new()?);

    tracing::info!("Starting LLM gateway...");

    // Store connections
    let catalog_pool = settings.stores.catalog_pool().await?;
    let invocations_pool = settings.stores.invocations_pool().await?;

    llm_gateway::config::database::init_catalog_tables(&catalog_pool).await?;
    llm_gateway::config::database::init_invocation_tables(&invocations_pool).await?;

    tracing::info!("Store connections established");

    // Catalog snapshot
    let catalog = Arc::new(CatalogService::new(Arc::new(SqliteCatalogStore::new(
        catalog_pool,
    ))));
    catalog.refresh().await?;

    // Auth subsystem + session sweeper
    let auth = Arc::new(AuthService::new(
        catalog.clone(),
        settings.auth.session_ttl_hours,
    ));
    auth.clone()
        .spawn_sweeper_task(Duration::from_secs(settings.auth.sweep_interval_secs));

    // Per-model token buckets + idle cleanup
    let limiter = ModelRateLimiter::new();
    limiter.clone().spawn_cleanup_task(Duration::from_secs(600));

    // Provider adapters behind the router engine
    let dispatcher = Arc::new(ProviderDispatcher::new(catalog.clone())?);
    let router_service = Arc::new(RouterService::new(
        catalog.clone(),
        auth.clone(),
        limiter,
        dispatcher,
    ));

    // Invocation recorder
    let recorder = Arc::new(InvocationRecorder::spawn(
        Arc::new(SqliteInvocationStore::new(invocations_pool)),
        &settings.recorder,
    ));

    let state = AppState {
        catalog,
        auth,
        router: router_service,
        recorder: recorder.clone(),
        settings: settings.clone(),
    };

    // Blanket per-IP limiter across the whole surface
    let blanket_limiter = PerIpRateLimiter::new(
        settings.limits.requests_per_minute,
        Duration::from_secs(600),
    );
    blanket_limiter.clone().spawn_cleanup_task();

    // Build CORS layer with allowed origins from config
    let allowed_origins: Vec<axum::http::HeaderValue> = settings
        .cors
        .allowed_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<axum::http::HeaderValue>().ok().or_else(|| {
                tracing::warn!("Invalid CORS origin, skipping: {}", origin);
                None
            })
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            header::HeaderName::from_static("x-api-key"),
            header::HeaderName::from_static("x-session-token"),
        ]);

    // Build router
    let app = Router::new()
        .merge(routes::api_routes(state.clone(), blanket_limiter))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(settings.limits.body_limit_bytes))
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Gateway listening on http://{}", addr);

    // ConnectInfo carries the peer address the loopback bypass inspects.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Drain queued invocation records before exiting.
    recorder
        .shutdown(Duration::from_secs(settings.recorder.shutdown_grace_secs))
        .await;
    tracing::info!("Gateway stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
