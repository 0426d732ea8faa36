//! Business (tenant) configuration lookups.
//!
//! The pipeline only reads configs; CRUD lives elsewhere.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;
use tokio::sync::RwLock;

use herald_common::error::{AppError, AppResult};
use herald_common::types::{
    BusinessConfig, CallbackConfig, ChannelConfig, QuotaConfig, RetryPolicy,
};

#[async_trait]
pub trait BusinessConfigService: Send + Sync {
    /// Fetch the config for `biz_id`, or `BizConfigNotFound`.
    async fn get_by_id(&self, biz_id: i64) -> AppResult<BusinessConfig>;
}

/// In-memory config store.
#[derive(Default)]
pub struct StaticBusinessConfigService {
    configs: RwLock<HashMap<i64, BusinessConfig>>,
}

impl StaticBusinessConfigService {
    pub fn new(configs: impl IntoIterator<Item = BusinessConfig>) -> Self {
        Self {
            configs: RwLock::new(configs.into_iter().map(|c| (c.id, c)).collect()),
        }
    }

    pub async fn upsert(&self, config: BusinessConfig) {
        self.configs.write().await.insert(config.id, config);
    }
}

#[async_trait]
impl BusinessConfigService for StaticBusinessConfigService {
    async fn get_by_id(&self, biz_id: i64) -> AppResult<BusinessConfig> {
        self.configs
            .read()
            .await
            .get(&biz_id)
            .cloned()
            .ok_or(AppError::BizConfigNotFound(biz_id))
    }
}

#[derive(sqlx::FromRow)]
struct BusinessConfigRow {
    id: i64,
    rate_limit: i32,
    quota: Option<Json<QuotaConfig>>,
    channel_config: Option<Json<ChannelConfig>>,
    retry_policy: Option<Json<RetryPolicy>>,
    callback_config: Option<Json<CallbackConfig>>,
}

impl From<BusinessConfigRow> for BusinessConfig {
    fn from(row: BusinessConfigRow) -> Self {
        Self {
            id: row.id,
            rate_limit: row.rate_limit.max(0) as u32,
            quota: row.quota.map(|j| j.0),
            channel_config: row.channel_config.map(|j| j.0),
            retry_policy: row.retry_policy.map(|j| j.0),
            callback_config: row.callback_config.map(|j| j.0),
        }
    }
}

/// Postgres-backed config store reading `business_configs`.
pub struct PgBusinessConfigService {
    pool: PgPool,
}

impl PgBusinessConfigService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BusinessConfigService for PgBusinessConfigService {
    async fn get_by_id(&self, biz_id: i64) -> AppResult<BusinessConfig> {
        let row: Option<BusinessConfigRow> = sqlx::query_as(
            r#"
            SELECT id, rate_limit, quota, channel_config, retry_policy, callback_config
            FROM business_configs
            WHERE id = $1
            "#,
        )
        .bind(biz_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BusinessConfig::from)
            .ok_or(AppError::BizConfigNotFound(biz_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_lookup_and_upsert() {
        let service = StaticBusinessConfigService::new([BusinessConfig::new(1)]);
        assert_eq!(service.get_by_id(1).await.unwrap().rate_limit, 0);
        assert!(matches!(
            service.get_by_id(2).await,
            Err(AppError::BizConfigNotFound(2))
        ));

        let mut updated = BusinessConfig::new(1);
        updated.rate_limit = 5;
        service.upsert(updated).await;
        assert_eq!(service.get_by_id(1).await.unwrap().rate_limit, 5);
    }

    #[test]
    fn test_row_conversion_clamps_negative_rate_limit() {
        let row = BusinessConfigRow {
            id: 3,
            rate_limit: -1,
            quota: None,
            channel_config: None,
            retry_policy: Some(Json(RetryPolicy::default())),
            callback_config: None,
        };
        let config = BusinessConfig::from(row);
        assert_eq!(config.rate_limit, 0);
        assert_eq!(config.retry_policy, Some(RetryPolicy::default()));
    }
}
