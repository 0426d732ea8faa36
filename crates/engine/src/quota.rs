//! Monthly per-channel send budgets.
//!
//! A batch is admitted only if every channel it touches still has enough budget
//! for all of its notifications; admission and decrement happen as one step.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;

use herald_common::error::AppResult;
use herald_common::types::{BusinessConfig, Channel, Notification};

/// Counters outlive their month by a few days so late batches still see them.
const COUNTER_TTL_SECONDS: i64 = 40 * 24 * 3600;

/// Check every counter, then decrement them all; a counter missing for the
/// current month is seeded from its limit. Returns 1 when admitted.
///
/// KEYS: counter keys. ARGV: ttl, then (requested, limit) per key.
const ADMIT_SCRIPT: &str = r#"
local ttl = tonumber(ARGV[1])
for i, key in ipairs(KEYS) do
    local limit = tonumber(ARGV[2 * i + 1])
    redis.call('SET', key, limit, 'NX', 'EX', ttl)
    local requested = tonumber(ARGV[2 * i])
    if tonumber(redis.call('GET', key)) < requested then
        return 0
    end
end
for i, key in ipairs(KEYS) do
    redis.call('DECRBY', key, tonumber(ARGV[2 * i]))
end
return 1
"#;

#[async_trait]
pub trait QuotaService: Send + Sync {
    /// Reserve budget for `notifications`. `false` means the batch is denied and
    /// nothing was reserved.
    async fn admit(&self, config: &BusinessConfig, notifications: &[Notification]) -> AppResult<bool>;
}

/// Budget a batch asks of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDemand {
    pub channel: Channel,
    pub requested: i64,
    pub limit: i64,
}

/// Per-channel demand of a batch, for channels the business caps.
pub fn demand(config: &BusinessConfig, notifications: &[Notification]) -> Vec<QuotaDemand> {
    let Some(quota) = &config.quota else {
        return Vec::new();
    };

    let mut counts: HashMap<Channel, i64> = HashMap::new();
    for n in notifications {
        *counts.entry(n.channel).or_default() += 1;
    }

    let mut demands: Vec<_> = counts
        .into_iter()
        .filter_map(|(channel, requested)| {
            quota.monthly.get(&channel).map(|&limit| QuotaDemand {
                channel,
                requested,
                limit,
            })
        })
        .collect();
    demands.sort_by_key(|d| d.channel.to_string());
    demands
}

pub fn counter_key(biz_id: i64, channel: Channel, now: DateTime<Utc>) -> String {
    format!("quota:{}:{}:{}", biz_id, channel, now.format("%Y%m"))
}

/// Admits everything.
pub struct UnlimitedQuota;

#[async_trait]
impl QuotaService for UnlimitedQuota {
    async fn admit(&self, _config: &BusinessConfig, _notifications: &[Notification]) -> AppResult<bool> {
        Ok(true)
    }
}

/// Redis counters shared by every process of the deployment.
pub struct RedisQuotaService {
    redis: ConnectionManager,
    script: redis::Script,
}

impl RedisQuotaService {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            script: redis::Script::new(ADMIT_SCRIPT),
        }
    }
}

#[async_trait]
impl QuotaService for RedisQuotaService {
    async fn admit(&self, config: &BusinessConfig, notifications: &[Notification]) -> AppResult<bool> {
        let demands = demand(config, notifications);
        if demands.is_empty() {
            return Ok(true);
        }

        let now = Utc::now();
        let mut invocation = self.script.prepare_invoke();
        invocation.arg(COUNTER_TTL_SECONDS);
        for d in &demands {
            invocation
                .key(counter_key(config.id, d.channel, now))
                .arg(d.requested)
                .arg(d.limit);
        }

        let mut conn = self.redis.clone();
        let admitted: i64 = invocation.invoke_async(&mut conn).await?;

        if admitted == 0 {
            tracing::warn!(
                biz_id = config.id,
                batch_size = notifications.len(),
                "Quota exhausted, batch denied"
            );
        }
        Ok(admitted == 1)
    }
}

/// Process-local counters with the same check-then-decrement rule.
#[derive(Default)]
pub struct MemoryQuotaService {
    remaining: Mutex<HashMap<String, i64>>,
}

impl MemoryQuotaService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn remaining(&self, biz_id: i64, channel: Channel) -> Option<i64> {
        self.remaining
            .lock()
            .await
            .get(&counter_key(biz_id, channel, Utc::now()))
            .copied()
    }
}

#[async_trait]
impl QuotaService for MemoryQuotaService {
    async fn admit(&self, config: &BusinessConfig, notifications: &[Notification]) -> AppResult<bool> {
        let now = Utc::now();
        let mut remaining = self.remaining.lock().await;
        let demands = demand(config, notifications);

        for d in &demands {
            let left = *remaining
                .entry(counter_key(config.id, d.channel, now))
                .or_insert(d.limit);
            if left < d.requested {
                return Ok(false);
            }
        }
        for d in &demands {
            if let Some(left) = remaining.get_mut(&counter_key(config.id, d.channel, now)) {
                *left -= d.requested;
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::make_notification;
    use chrono::TimeZone;
    use herald_common::types::QuotaConfig;

    fn capped(limits: &[(Channel, i64)]) -> BusinessConfig {
        let mut config = BusinessConfig::new(9);
        config.quota = Some(QuotaConfig {
            monthly: limits.iter().copied().collect(),
        });
        config
    }

    fn batch(channels: &[Channel]) -> Vec<Notification> {
        channels
            .iter()
            .enumerate()
            .map(|(i, channel)| {
                let mut n = make_notification(9, &format!("k{i}"));
                n.channel = *channel;
                n
            })
            .collect()
    }

    #[test]
    fn test_demand_groups_by_capped_channel() {
        let config = capped(&[(Channel::Sms, 10)]);
        let demands = demand(&config, &batch(&[Channel::Sms, Channel::Email, Channel::Sms]));
        assert_eq!(
            demands,
            vec![QuotaDemand {
                channel: Channel::Sms,
                requested: 2,
                limit: 10
            }]
        );
        assert!(demand(&BusinessConfig::new(9), &batch(&[Channel::Sms])).is_empty());
    }

    #[test]
    fn test_counter_key_is_monthly() {
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 12, 0, 0).unwrap();
        assert_eq!(counter_key(9, Channel::InApp, at), "quota:9:in_app:202503");
    }

    #[tokio::test]
    async fn test_memory_quota_denies_without_reserving() {
        let quota = MemoryQuotaService::new();
        let config = capped(&[(Channel::Sms, 3), (Channel::Email, 1)]);

        assert!(quota.admit(&config, &batch(&[Channel::Sms, Channel::Sms])).await.unwrap());
        assert_eq!(quota.remaining(9, Channel::Sms).await, Some(1));

        // Email fits, SMS does not: nothing is taken from either.
        let denied = batch(&[Channel::Sms, Channel::Sms, Channel::Email]);
        assert!(!quota.admit(&config, &denied).await.unwrap());
        assert_eq!(quota.remaining(9, Channel::Sms).await, Some(1));
        assert_eq!(quota.remaining(9, Channel::Email).await, Some(1));
    }

    #[tokio::test]
    async fn test_unlimited_admits() {
        let config = capped(&[(Channel::Sms, 0)]);
        assert!(UnlimitedQuota.admit(&config, &batch(&[Channel::Sms])).await.unwrap());
    }
}
