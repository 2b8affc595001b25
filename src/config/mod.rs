pub mod database;
mod settings;

pub use database::StoreConfig;
pub use settings::{
    AuthConfig, CorsConfig, LimitsConfig, RecorderConfig, ServerConfig, Settings,
};
