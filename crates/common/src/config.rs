use serde::Deserialize;

use crate::types::Channel;

/// One vendor endpoint the node may deliver through.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderEndpoint {
    pub name: String,
    pub channel: Channel,
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (quota counters)
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Fixed number of sender workers (default: 32)
    pub sender_workers: usize,

    /// Bounded sender job queue length (default: 1024)
    pub sender_queue_capacity: usize,

    /// Interval between provider recovery probes (default: 30s)
    pub health_check_interval_secs: u64,

    /// Timeout for one provider recovery probe (default: 3000ms)
    pub health_check_timeout_ms: u64,

    /// 64-bit words in each provider's failure bitmap (default: 2)
    pub health_bitmap_words: usize,

    /// Vendor endpoints, from the `PROVIDERS` JSON array
    pub providers: Vec<ProviderEndpoint>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 20)?,
            sender_workers: parse_var("SENDER_WORKERS", 32)?,
            sender_queue_capacity: parse_var("SENDER_QUEUE_CAPACITY", 1024)?,
            health_check_interval_secs: parse_var("HEALTH_CHECK_INTERVAL_SECS", 30)?,
            health_check_timeout_ms: parse_var("HEALTH_CHECK_TIMEOUT_MS", 3000)?,
            health_bitmap_words: parse_var("HEALTH_BITMAP_WORDS", 2)?,
            providers: match std::env::var("PROVIDERS") {
                Ok(raw) => parse_providers(&raw)?,
                Err(_) => Vec::new(),
            },
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{name} must be a valid {}", std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

/// Parse the `PROVIDERS` JSON array.
pub fn parse_providers(raw: &str) -> anyhow::Result<Vec<ProviderEndpoint>> {
    let providers: Vec<ProviderEndpoint> = serde_json::from_str(raw)
        .map_err(|e| anyhow::anyhow!("PROVIDERS must be a JSON array of providers: {e}"))?;
    Ok(providers)
}
