use std::time::Duration;

use redis::Client;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};

/// Create a Redis connection manager for the quota counters.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let config = ConnectionManagerConfig::new()
        .set_connection_timeout(Duration::from_secs(2))
        .set_response_timeout(Duration::from_millis(500))
        .set_number_of_retries(3);
    let manager = ConnectionManager::new_with_config(client, config).await?;

    tracing::info!(redis_url, "Connected to Redis");
    Ok(manager)
}
