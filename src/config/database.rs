use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Catalog store (providers, models, credentials).
    pub catalog_url: String,
    /// Invocation store (observability rows). Kept separate so observability
    /// writes never contend with catalog reads.
    pub invocations_url: String,
    pub max_connections: u32,
}

impl StoreConfig {
    pub async fn catalog_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(&self.catalog_url)
            .await
    }

    pub async fn invocations_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(&self.invocations_url)
            .await
    }
}

/// Create the catalog tables if they do not exist.
///
/// JSON-valued columns are TEXT serialized with serde_json. Rows are written
/// by configuration sync (out of scope here); the gateway only reads them.
pub async fn init_catalog_tables(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS providers (
            name            TEXT PRIMARY KEY,
            provider_type   TEXT NOT NULL,
            base_url        TEXT,
            api_keys        TEXT NOT NULL DEFAULT '[]',
            settings        TEXT NOT NULL DEFAULT '{}',
            is_active       INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS models (
            provider_name      TEXT NOT NULL,
            model_name         TEXT NOT NULL,
            display_name       TEXT,
            description        TEXT,
            remote_identifier  TEXT,
            tags               TEXT NOT NULL DEFAULT '[]',
            default_params     TEXT NOT NULL DEFAULT '{}',
            config             TEXT NOT NULL DEFAULT '{}',
            rate_limit         TEXT,
            is_active          INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (provider_name, model_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS credentials (
            id                 TEXT PRIMARY KEY,
            secret             TEXT NOT NULL,
            is_active          INTEGER NOT NULL DEFAULT 1,
            allowed_models     TEXT,
            allowed_providers  TEXT,
            parameter_limits   TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the invocation table if it does not exist.
pub async fn init_invocation_tables(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS invocations (
            id                    TEXT PRIMARY KEY,
            provider_name         TEXT NOT NULL,
            model_name            TEXT NOT NULL,
            started_at            TEXT NOT NULL,
            completed_at          TEXT NOT NULL,
            duration_ms           INTEGER NOT NULL,
            status                TEXT NOT NULL,
            error_message         TEXT,
            request_prompt        TEXT,
            request_messages      TEXT,
            request_parameters    TEXT NOT NULL DEFAULT '{}',
            response_text         TEXT,
            response_text_length  INTEGER,
            prompt_tokens         INTEGER,
            completion_tokens     INTEGER,
            total_tokens          INTEGER,
            cost                  REAL,
            raw_response          TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_invocations_started_at ON invocations (started_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_invocations_model ON invocations (provider_name, model_name)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
