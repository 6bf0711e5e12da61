use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Control plane
    pub backend_url: String,
    pub api_key: String,

    // Database settings; `None` disables the notification bridge
    pub postgres: Option<PostgresConfig>,

    // Function execution
    pub function_timeout: Duration,
    pub functions_dir: PathBuf,
    pub handler_runtime: String,
    pub cache_dir: PathBuf,

    // CORS settings
    pub cors_allowed_origin: String,
}

/// Connection settings for the shared Postgres instance.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let backend_url = env::var("BACKEND_URL")
            .map_err(|_| anyhow::anyhow!("BACKEND_URL environment variable is required"))?;
        let api_key = env::var("API_KEY")
            .map_err(|_| anyhow::anyhow!("API_KEY environment variable is required"))?;

        let postgres = env::var("POSTGRES_HOST").ok().map(|host| PostgresConfig {
            host,
            port: env::var("POSTGRES_PORT")
                .unwrap_or_else(|_| "5432".to_string())
                .parse()
                .unwrap_or(5432),
            user: env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: env::var("POSTGRES_PASSWORD").unwrap_or_default(),
            database: env::var("POSTGRES_DB").unwrap_or_else(|_| "postgres".to_string()),
        });

        Ok(Self {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8090".to_string())
                .parse()
                .unwrap_or(8090),

            backend_url: backend_url.trim_end_matches('/').to_string(),
            api_key,

            postgres,

            function_timeout: Duration::from_millis(
                env::var("FUNCTION_TIMEOUT")
                    .unwrap_or_else(|_| "30000".to_string())
                    .parse()
                    .unwrap_or(30_000),
            ),
            functions_dir: env::var("FUNCTIONS_DIR")
                .unwrap_or_else(|_| "./functions".to_string())
                .into(),
            handler_runtime: env::var("HANDLER_RUNTIME").unwrap_or_else(|_| "deno".to_string()),
            cache_dir: env::var("CACHE_DIR")
                .unwrap_or_else(|_| "./cache".to_string())
                .into(),

            cors_allowed_origin: env::var("CORS_ALLOWED_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        })
    }

    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.functions_dir)?;
        std::fs::create_dir_all(&self.cache_dir)?;
        Ok(())
    }
}
