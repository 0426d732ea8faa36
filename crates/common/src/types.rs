use std::collections::HashMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Delivery medium a notification is sent over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Email,
    InApp,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Sms => write!(f, "sms"),
            Channel::Email => write!(f, "email"),
            Channel::InApp => write!(f, "in_app"),
        }
    }
}

/// Notification lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum NotificationStatus {
    Prepare,
    Pending,
    Sending,
    Canceled,
    Succeeded,
    Failed,
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationStatus::Prepare => write!(f, "prepare"),
            NotificationStatus::Pending => write!(f, "pending"),
            NotificationStatus::Sending => write!(f, "sending"),
            NotificationStatus::Canceled => write!(f, "canceled"),
            NotificationStatus::Succeeded => write!(f, "succeeded"),
            NotificationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Discriminant of [`SendStrategy`], used to check batch homogeneity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStrategyType {
    Immediate,
    Delayed,
    Scheduled,
    TimeWindow,
    Deadline,
}

impl std::fmt::Display for SendStrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendStrategyType::Immediate => write!(f, "immediate"),
            SendStrategyType::Delayed => write!(f, "delayed"),
            SendStrategyType::Scheduled => write!(f, "scheduled"),
            SendStrategyType::TimeWindow => write!(f, "time_window"),
            SendStrategyType::Deadline => write!(f, "deadline"),
        }
    }
}

/// How long an immediate notification stays eligible for the scanner if the
/// synchronous attempt never completes.
const IMMEDIATE_WINDOW_HOURS: i64 = 1;

/// When a notification becomes eligible to be transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SendStrategy {
    /// Send right now, synchronously with the request.
    Immediate,
    /// Send after `delay_seconds` from submission.
    Delayed { delay_seconds: i64 },
    /// Send at one exact instant.
    Scheduled { send_at: DateTime<Utc> },
    /// Send anywhere inside `[start_ms, end_ms]` (unix milliseconds).
    TimeWindow { start_ms: i64, end_ms: i64 },
    /// Send any time before `deadline`.
    Deadline { deadline: DateTime<Utc> },
}

impl SendStrategy {
    pub fn kind(&self) -> SendStrategyType {
        match self {
            SendStrategy::Immediate => SendStrategyType::Immediate,
            SendStrategy::Delayed { .. } => SendStrategyType::Delayed,
            SendStrategy::Scheduled { .. } => SendStrategyType::Scheduled,
            SendStrategy::TimeWindow { .. } => SendStrategyType::TimeWindow,
            SendStrategy::Deadline { .. } => SendStrategyType::Deadline,
        }
    }

    /// Validate the strategy parameters and compute the `[start, end]` window in
    /// which the notification may be sent, relative to `now`.
    pub fn send_window(&self, now: DateTime<Utc>) -> AppResult<(DateTime<Utc>, DateTime<Utc>)> {
        match *self {
            SendStrategy::Immediate => Ok((now, now + Duration::hours(IMMEDIATE_WINDOW_HOURS))),
            SendStrategy::Delayed { delay_seconds } => {
                if delay_seconds <= 0 {
                    return Err(AppError::InvalidParameter(format!(
                        "delay_seconds must be positive, got {delay_seconds}"
                    )));
                }
                Ok((now, now + Duration::seconds(delay_seconds)))
            }
            SendStrategy::Scheduled { send_at } => {
                if send_at < now {
                    return Err(AppError::InvalidParameter(format!(
                        "scheduled time {send_at} is in the past"
                    )));
                }
                Ok((send_at, send_at))
            }
            SendStrategy::TimeWindow { start_ms, end_ms } => {
                if start_ms <= 0 || start_ms >= end_ms || end_ms <= now.timestamp_millis() {
                    return Err(AppError::InvalidParameter(format!(
                        "invalid time window [{start_ms}, {end_ms}]"
                    )));
                }
                let start = millis_to_datetime(start_ms)?;
                let end = millis_to_datetime(end_ms)?;
                Ok((start, end))
            }
            SendStrategy::Deadline { deadline } => {
                if deadline < now {
                    return Err(AppError::InvalidParameter(format!(
                        "deadline {deadline} is in the past"
                    )));
                }
                Ok((now, deadline))
            }
        }
    }
}

fn millis_to_datetime(ms: i64) -> AppResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| AppError::InvalidParameter(format!("timestamp {ms} out of range")))
}

/// Reference to a template version plus its render parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub version_id: i64,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// The unit of work flowing through the delivery pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Time-sortable identifier (UUIDv7).
    pub id: Uuid,
    pub biz_id: i64,
    /// Idempotency key, unique per `biz_id`.
    pub key: String,
    pub receivers: Vec<String>,
    pub channel: Channel,
    pub template: Template,
    pub strategy: SendStrategy,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub status: NotificationStatus,
    pub retry_count: u32,
    /// Optimistic-concurrency token, bumped on every status change.
    pub version: i32,
}

impl Notification {
    pub fn new(
        biz_id: i64,
        key: impl Into<String>,
        receivers: Vec<String>,
        channel: Channel,
        template: Template,
        strategy: SendStrategy,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            biz_id,
            key: key.into(),
            receivers,
            channel,
            template,
            strategy,
            scheduled_start: now,
            scheduled_end: now,
            status: NotificationStatus::Prepare,
            retry_count: 0,
            version: 1,
        }
    }

    /// Check the caller-supplied fields that every strategy relies on.
    pub fn validate(&self) -> AppResult<()> {
        if self.biz_id <= 0 {
            return Err(AppError::InvalidParameter(format!(
                "biz_id must be positive, got {}",
                self.biz_id
            )));
        }
        if self.key.trim().is_empty() {
            return Err(AppError::InvalidParameter("key must not be empty".to_string()));
        }
        if self.receivers.is_empty() || self.receivers.iter().any(|r| r.trim().is_empty()) {
            return Err(AppError::InvalidParameter(
                "at least one non-empty receiver is required".to_string(),
            ));
        }
        if self.template.id <= 0 {
            return Err(AppError::InvalidParameter(format!(
                "template id must be positive, got {}",
                self.template.id
            )));
        }
        Ok(())
    }

    /// Apply the strategy's window to the scheduling fields.
    pub fn apply_send_window(&mut self, now: DateTime<Utc>) -> AppResult<()> {
        let (start, end) = self.strategy.send_window(now)?;
        self.scheduled_start = start;
        self.scheduled_end = end;
        Ok(())
    }

    pub fn response(&self) -> SendResponse {
        SendResponse {
            notification_id: self.id,
            status: self.status,
            retry_count: self.retry_count,
        }
    }
}

/// Per-notification outcome, returned on both the sync and async paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    pub notification_id: Uuid,
    pub status: NotificationStatus,
    pub retry_count: u32,
}

/// Aggregated outcome of a batch submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSendResponse {
    pub results: Vec<SendResponse>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub pending: usize,
}

impl BatchSendResponse {
    pub fn from_results(results: Vec<SendResponse>) -> Self {
        let count = |status| results.iter().filter(|r| r.status == status).count();
        let succeeded = count(NotificationStatus::Succeeded);
        let failed = count(NotificationStatus::Failed);
        let pending = count(NotificationStatus::Pending);
        Self {
            total: results.len(),
            succeeded,
            failed,
            pending,
            results,
        }
    }
}

/// Retry schedule applied to one channel before failing over to the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts made against one channel (at least one is always made).
    pub max_retries: u32,
    /// Wait before each retry, in milliseconds. Retries past the end of the list
    /// wait [`RetryPolicy::FALLBACK_INTERVAL_MS`].
    #[serde(default)]
    pub intervals_ms: Vec<u64>,
}

impl RetryPolicy {
    pub const FALLBACK_INTERVAL_MS: u64 = 1000;

    /// Backoff before retry number `attempt` (0-based).
    pub fn interval(&self, attempt: usize) -> std::time::Duration {
        let ms = self
            .intervals_ms
            .get(attempt)
            .copied()
            .unwrap_or(Self::FALLBACK_INTERVAL_MS);
        std::time::Duration::from_millis(ms)
    }

    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            intervals_ms: vec![1000, 2000, 3000],
        }
    }
}

/// One entry of a business's channel preference list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelItem {
    pub channel: Channel,
    #[serde(default)]
    pub priority: i32,
    pub enabled: bool,
    /// Overrides the business-wide retry policy for this channel.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channels: Vec<ChannelItem>,
}

/// Monthly per-channel send budgets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub monthly: HashMap<Channel, i64>,
}

/// Where and how to report results back to the business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackConfig {
    pub service_name: String,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

/// Per-tenant delivery settings, read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessConfig {
    pub id: i64,
    /// Maximum notifications per sender batch; `0` disables the check.
    pub rate_limit: u32,
    pub quota: Option<QuotaConfig>,
    pub channel_config: Option<ChannelConfig>,
    pub retry_policy: Option<RetryPolicy>,
    pub callback_config: Option<CallbackConfig>,
}

impl BusinessConfig {
    /// A config with no limits, no alternative channels and the default retry policy.
    pub fn new(id: i64) -> Self {
        Self {
            id,
            rate_limit: 0,
            quota: None,
            channel_config: None,
            retry_policy: None,
            callback_config: None,
        }
    }

    /// Retry policy for `channel`: channel override, then business default, then
    /// the built-in default.
    pub fn retry_policy_for(&self, channel: Channel) -> RetryPolicy {
        self.channel_config
            .as_ref()
            .and_then(|cfg| cfg.channels.iter().find(|item| item.channel == channel))
            .and_then(|item| item.retry_policy.clone())
            .or_else(|| self.retry_policy.clone())
            .unwrap_or_default()
    }

    pub fn wants_callback(&self) -> bool {
        self.callback_config.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_notification(strategy: SendStrategy) -> Notification {
        Notification::new(
            1,
            "order-1",
            vec!["+15550100".to_string()],
            Channel::Sms,
            Template {
                id: 10,
                version_id: 1,
                params: HashMap::new(),
            },
            strategy,
        )
    }

    #[test]
    fn test_immediate_window_is_one_hour() {
        let now = Utc::now();
        let (start, end) = SendStrategy::Immediate.send_window(now).unwrap();
        assert_eq!(start, now);
        assert_eq!(end - start, Duration::hours(1));
    }

    #[test]
    fn test_delayed_requires_positive_delay() {
        let now = Utc::now();
        assert!(matches!(
            SendStrategy::Delayed { delay_seconds: 0 }.send_window(now),
            Err(AppError::InvalidParameter(_))
        ));
        let (start, end) = SendStrategy::Delayed { delay_seconds: 30 }
            .send_window(now)
            .unwrap();
        assert_eq!(start, now);
        assert_eq!(end, now + Duration::seconds(30));
    }

    #[test]
    fn test_scheduled_in_past_rejected() {
        let now = Utc::now();
        let strategy = SendStrategy::Scheduled {
            send_at: now - Duration::seconds(1),
        };
        assert!(strategy.send_window(now).is_err());

        let at = now + Duration::minutes(5);
        let (start, end) = SendStrategy::Scheduled { send_at: at }
            .send_window(now)
            .unwrap();
        assert_eq!((start, end), (at, at));
    }

    #[test]
    fn test_time_window_end_before_start_rejected() {
        let now = Utc::now();
        let strategy = SendStrategy::TimeWindow {
            start_ms: now.timestamp_millis() + 10_000,
            end_ms: now.timestamp_millis() + 5_000,
        };
        assert!(matches!(
            strategy.send_window(now),
            Err(AppError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_time_window_already_closed_rejected() {
        let now = Utc::now();
        let strategy = SendStrategy::TimeWindow {
            start_ms: now.timestamp_millis() - 10_000,
            end_ms: now.timestamp_millis() - 5_000,
        };
        assert!(strategy.send_window(now).is_err());
    }

    #[test]
    fn test_time_window_bounds() {
        let now = Utc::now();
        let start_ms = now.timestamp_millis() + 1_000;
        let end_ms = now.timestamp_millis() + 60_000;
        let (start, end) = SendStrategy::TimeWindow { start_ms, end_ms }
            .send_window(now)
            .unwrap();
        assert_eq!(start.timestamp_millis(), start_ms);
        assert_eq!(end.timestamp_millis(), end_ms);
    }

    #[test]
    fn test_deadline_window() {
        let now = Utc::now();
        let deadline = now + Duration::hours(3);
        let (start, end) = SendStrategy::Deadline { deadline }
            .send_window(now)
            .unwrap();
        assert_eq!((start, end), (now, deadline));
        assert!(SendStrategy::Deadline {
            deadline: now - Duration::hours(1)
        }
        .send_window(now)
        .is_err());
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let mut n = make_notification(SendStrategy::Immediate);
        assert!(n.validate().is_ok());

        n.receivers.clear();
        assert!(n.validate().is_err());

        let mut n = make_notification(SendStrategy::Immediate);
        n.key = "  ".to_string();
        assert!(n.validate().is_err());

        let mut n = make_notification(SendStrategy::Immediate);
        n.template.id = 0;
        assert!(n.validate().is_err());
    }

    #[test]
    fn test_strategy_serde_is_tagged() {
        let json = serde_json::to_value(SendStrategy::Delayed { delay_seconds: 5 }).unwrap();
        assert_eq!(json["type"], "delayed");
        assert_eq!(json["delay_seconds"], 5);
    }

    #[test]
    fn test_retry_policy_interval_fallback() {
        let policy = RetryPolicy {
            max_retries: 5,
            intervals_ms: vec![10, 20],
        };
        assert_eq!(policy.interval(0).as_millis(), 10);
        assert_eq!(policy.interval(1).as_millis(), 20);
        assert_eq!(policy.interval(4).as_millis(), 1000);
        assert_eq!(RetryPolicy { max_retries: 0, intervals_ms: vec![] }.attempts(), 1);
    }

    #[test]
    fn test_retry_policy_channel_override() {
        let mut config = BusinessConfig::new(7);
        config.retry_policy = Some(RetryPolicy {
            max_retries: 2,
            intervals_ms: vec![5],
        });
        config.channel_config = Some(ChannelConfig {
            channels: vec![ChannelItem {
                channel: Channel::Email,
                priority: 0,
                enabled: true,
                retry_policy: Some(RetryPolicy {
                    max_retries: 4,
                    intervals_ms: vec![],
                }),
            }],
        });

        assert_eq!(config.retry_policy_for(Channel::Email).max_retries, 4);
        assert_eq!(config.retry_policy_for(Channel::Sms).max_retries, 2);
        assert_eq!(BusinessConfig::new(8).retry_policy_for(Channel::Sms), RetryPolicy::default());
    }

    #[test]
    fn test_batch_response_counts() {
        let id = Uuid::now_v7();
        let results = vec![
            SendResponse { notification_id: id, status: NotificationStatus::Succeeded, retry_count: 0 },
            SendResponse { notification_id: id, status: NotificationStatus::Failed, retry_count: 2 },
            SendResponse { notification_id: id, status: NotificationStatus::Pending, retry_count: 0 },
        ];
        let batch = BatchSendResponse::from_results(results);
        assert_eq!(batch.total, 3);
        assert_eq!((batch.succeeded, batch.failed, batch.pending), (1, 1, 1));
    }
}
