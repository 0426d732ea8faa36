use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use herald_common::config::AppConfig;
use herald_common::{db, redis_pool};
use herald_engine::business_config::PgBusinessConfigService;
use herald_engine::pipeline::{DeliveryPipeline, providers_from_endpoints};
use herald_engine::provider::LoadBalancerConfig;
use herald_engine::quota::RedisQuotaService;
use herald_engine::repository::PgNotificationRepository;
use herald_engine::sender::SenderConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_notifier=info,herald_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald notifier starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::migrate(&pool).await?;

    let redis = redis_pool::create_redis_pool(&config.redis_url).await?;

    let providers = providers_from_endpoints(
        &config.providers,
        LoadBalancerConfig {
            bitmap_words: config.health_bitmap_words,
            health_check_interval: Duration::from_secs(config.health_check_interval_secs),
            health_check_timeout: Duration::from_millis(config.health_check_timeout_ms),
        },
    )?;
    if config.providers.is_empty() {
        tracing::warn!("No providers configured, every delivery will fail");
    }

    let pipeline = DeliveryPipeline::new(
        Arc::new(PgNotificationRepository::new(pool.clone())),
        Arc::new(PgBusinessConfigService::new(pool)),
        Arc::new(RedisQuotaService::new(redis)),
        providers,
        SenderConfig {
            workers: config.sender_workers,
            queue_capacity: config.sender_queue_capacity,
        },
    );

    let shutdown = CancellationToken::new();
    let monitors = pipeline.spawn_health_monitors(&shutdown);
    tracing::info!(
        monitors = monitors.len(),
        workers = config.sender_workers,
        "Delivery pipeline ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");

    shutdown.cancel();
    for monitor in monitors {
        if let Err(e) = monitor.await {
            tracing::error!(error = %e, "Health monitor task failed");
        }
    }

    tracing::info!("Herald notifier stopped.");
    Ok(())
}
