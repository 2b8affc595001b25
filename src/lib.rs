use std::sync::Arc;

pub mod config;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

use config::Settings;
use services::{AuthService, CatalogService, InvocationRecorder, RouterService};

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<CatalogService>,
    pub auth: Arc<AuthService>,
    pub router: Arc<RouterService>,
    pub recorder: Arc<InvocationRecorder>,
    pub settings: Arc<Settings>,
}
