use super::StoreConfig;
use anyhow::Result;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Session lifetime in hours.
    pub session_ttl_hours: i64,
    /// How often the background sweeper evicts expired sessions.
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Bounded queue capacity; overflow drops records (never back-pressure).
    pub queue_capacity: usize,
    /// Records written per store round-trip.
    pub batch_size: usize,
    /// Capture full response text instead of truncating at 64 KiB.
    pub full_capture: bool,
    /// Drain budget at shutdown.
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Blanket per-IP quota across the whole API surface.
    pub requests_per_minute: u32,
    /// Default per-call deadline when the client sets none.
    pub request_timeout_secs: u64,
    /// Maximum request body size.
    pub body_limit_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub stores: StoreConfig,
    pub auth: AuthConfig,
    pub recorder: RecorderConfig,
    pub limits: LimitsConfig,
    pub cors: CorsConfig,
}

impl Settings {
    pub fn new() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            server: ServerConfig {
                port: std::env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .unwrap_or(8080),
                host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            },
            stores: StoreConfig {
                catalog_url: std::env::var("CATALOG_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://gateway_catalog.db?mode=rwc".to_string()),
                invocations_url: std::env::var("INVOCATIONS_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://gateway_invocations.db?mode=rwc".to_string()),
                max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            auth: AuthConfig {
                session_ttl_hours: std::env::var("SESSION_TTL_HOURS")
                    .unwrap_or_else(|_| "24".to_string())
                    .parse()
                    .unwrap_or(24),
                sweep_interval_secs: std::env::var("SESSION_SWEEP_INTERVAL_SECS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .unwrap_or(300),
            },
            recorder: RecorderConfig {
                queue_capacity: std::env::var("RECORDER_QUEUE_CAPACITY")
                    .unwrap_or_else(|_| "1024".to_string())
                    .parse()
                    .unwrap_or(1024),
                batch_size: std::env::var("RECORDER_BATCH_SIZE")
                    .unwrap_or_else(|_| "32".to_string())
                    .parse()
                    .unwrap_or(32),
                full_capture: std::env::var("RECORDER_FULL_CAPTURE")
                    .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false),
                shutdown_grace_secs: std::env::var("RECORDER_SHUTDOWN_GRACE_SECS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            limits: LimitsConfig {
                requests_per_minute: std::env::var("RATE_LIMIT_REQUESTS_PER_MINUTE")
                    .unwrap_or_else(|_| "120".to_string())
                    .parse()
                    .unwrap_or(120),
                request_timeout_secs: std::env::var("REQUEST_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "120".to_string())
                    .parse()
                    .unwrap_or(120),
                body_limit_bytes: std::env::var("MAX_BODY_SIZE")
                    .unwrap_or_else(|_| "10485760".to_string())
                    .parse()
                    .unwrap_or(10485760), // 10MB default
            },
            cors: CorsConfig {
                allowed_origins: std::env::var("CORS_ALLOWED_ORIGINS")
                    .unwrap_or_else(|_| "http://localhost:3000,http://localhost".to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
            },
        })
    }
}
