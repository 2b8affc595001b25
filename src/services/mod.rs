pub mod auth_service;
pub mod catalog_service;
pub mod providers;
pub mod rate_limit_service;
pub mod recorder_service;
pub mod router_service;

pub use auth_service::{AuthService, LoginOutcome, Principal};
pub use catalog_service::{
    CatalogService, CatalogSnapshot, CatalogStore, ModelFilter, SqliteCatalogStore,
    StaticCatalogStore,
};
pub use rate_limit_service::ModelRateLimiter;
pub use recorder_service::{
    InvocationRecorder, InvocationStore, MemoryInvocationStore, SqliteInvocationStore,
};
pub use router_service::{RouteQuery, RouterService};
