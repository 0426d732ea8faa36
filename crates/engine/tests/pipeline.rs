//! End-to-end pipeline tests over the in-memory repository and scripted
//! providers.
//!
//! ```bash
//! cargo test -p herald-engine --test pipeline
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use herald_common::error::AppError;
use herald_common::types::{
    BusinessConfig, CallbackConfig, Channel, ChannelConfig, ChannelItem, NotificationStatus,
    QuotaConfig, RetryPolicy, SendStrategy,
};
use herald_engine::business_config::StaticBusinessConfigService;
use herald_engine::pipeline::DeliveryPipeline;
use herald_engine::quota::MemoryQuotaService;
use herald_engine::repository::{
    CallbackLogStatus, MemoryNotificationRepository, NotificationRepository,
};
use herald_engine::sender::SenderConfig;
use herald_engine::testing::{ScriptedProvider, dispatcher_with, make_notification};

// ============================================================
// Shared helpers
// ============================================================

struct Harness {
    pipeline: Arc<DeliveryPipeline>,
    repo: Arc<MemoryNotificationRepository>,
    sms: Arc<ScriptedProvider>,
    email: Arc<ScriptedProvider>,
}

fn business() -> BusinessConfig {
    let mut config = BusinessConfig::new(1);
    config.rate_limit = 5;
    config.retry_policy = Some(RetryPolicy {
        max_retries: 2,
        intervals_ms: vec![1],
    });
    config.channel_config = Some(ChannelConfig {
        channels: vec![
            ChannelItem {
                channel: Channel::Sms,
                priority: 0,
                enabled: true,
                retry_policy: None,
            },
            ChannelItem {
                channel: Channel::Email,
                priority: 1,
                enabled: true,
                retry_policy: None,
            },
        ],
    });
    config
}

fn harness(config: BusinessConfig, sms: ScriptedProvider, email: ScriptedProvider) -> Harness {
    let sms = Arc::new(sms);
    let email = Arc::new(email);
    let repo = Arc::new(MemoryNotificationRepository::new());
    let pipeline = DeliveryPipeline::new(
        repo.clone(),
        Arc::new(StaticBusinessConfigService::new([config])),
        Arc::new(MemoryQuotaService::new()),
        dispatcher_with(&[
            (Channel::Sms, vec![sms.clone()]),
            (Channel::Email, vec![email.clone()]),
        ]),
        SenderConfig {
            workers: 8,
            queue_capacity: 16,
        },
    );
    Harness {
        pipeline: Arc::new(pipeline),
        repo,
        sms,
        email,
    }
}

fn healthy() -> Harness {
    harness(
        business(),
        ScriptedProvider::always_ok("sms-a"),
        ScriptedProvider::always_ok("mail-a"),
    )
}

// ============================================================
// Immediate strategy
// ============================================================

#[tokio::test]
async fn test_concurrent_duplicates_send_once() {
    let h = healthy();
    h.sms.set_send_delay(Duration::from_millis(30));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let pipeline = h.pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .send(make_notification(1, "otp-42"), &CancellationToken::new())
                    .await
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(response) => ids.push(response.notification_id),
            Err(e) => assert!(matches!(e, AppError::SendNotificationFailed(_)), "{e}"),
        }
    }

    assert!(!ids.is_empty());
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(h.sms.calls(), 1);
    assert_eq!(h.repo.len().await, 1);

    let stored = h.repo.get_by_key(1, "otp-42").await.unwrap();
    assert_eq!(stored.status, NotificationStatus::Succeeded);
}

#[tokio::test]
async fn test_failover_to_email() {
    let h = harness(
        business(),
        ScriptedProvider::always_failing("sms-a"),
        ScriptedProvider::always_ok("mail-a"),
    );

    let response = h
        .pipeline
        .send(make_notification(1, "k"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(response.status, NotificationStatus::Succeeded);
    assert_eq!(response.retry_count, 2);
    assert_eq!(h.sms.calls(), 2);
    assert_eq!(h.email.sent_ids(), vec![response.notification_id]);
}

#[tokio::test]
async fn test_every_channel_failing_reports_failed() {
    let h = harness(
        business(),
        ScriptedProvider::always_failing("sms-a"),
        ScriptedProvider::always_failing("mail-a"),
    );

    let response = h
        .pipeline
        .send(make_notification(1, "k"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.status, NotificationStatus::Failed);
    assert_eq!(response.retry_count, 3);
}

#[tokio::test]
async fn test_rate_limited_batch_creates_no_records() {
    let h = healthy();
    let batch = (0..6).map(|i| make_notification(1, &format!("k{i}"))).collect();

    let err = h
        .pipeline
        .batch_send(batch, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::RateLimited { limit: 5, .. }));
    assert!(h.repo.is_empty().await);
    assert_eq!(h.sms.calls(), 0);
}

#[tokio::test]
async fn test_quota_exhaustion() {
    let mut config = business();
    config.quota = Some(QuotaConfig {
        monthly: HashMap::from([(Channel::Sms, 3)]),
    });
    let h = harness(
        config,
        ScriptedProvider::always_ok("sms-a"),
        ScriptedProvider::always_ok("mail-a"),
    );
    let cancel = CancellationToken::new();

    let batch = (0..3).map(|i| make_notification(1, &format!("a{i}"))).collect();
    let response = h.pipeline.batch_send(batch, &cancel).await.unwrap();
    assert_eq!(response.succeeded, 3);

    let err = h
        .pipeline
        .send(make_notification(1, "over"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::QuotaExceeded(1)));

    // The denied record is released rather than left claimed.
    let denied = h.repo.get_by_key(1, "over").await.unwrap();
    assert_eq!(denied.status, NotificationStatus::Failed);
    assert_eq!(denied.version, 2);

    // Resubmitting the same key goes back through admission.
    let err = h
        .pipeline
        .send(make_notification(1, "over"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::QuotaExceeded(1)));
    assert_eq!(h.sms.calls(), 3);

    let denied = h.repo.get_by_key(1, "over").await.unwrap();
    assert_eq!(denied.status, NotificationStatus::Failed);
}

#[tokio::test]
async fn test_quota_denied_batch_released() {
    let mut config = business();
    config.quota = Some(QuotaConfig {
        monthly: HashMap::from([(Channel::Sms, 2)]),
    });
    let h = harness(
        config,
        ScriptedProvider::always_ok("sms-a"),
        ScriptedProvider::always_ok("mail-a"),
    );

    let batch = (0..3).map(|i| make_notification(1, &format!("b{i}"))).collect();
    let err = h
        .pipeline
        .batch_send(batch, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::QuotaExceeded(1)));
    assert_eq!(h.sms.calls(), 0);

    for i in 0..3 {
        let n = h.repo.get_by_key(1, &format!("b{i}")).await.unwrap();
        assert_eq!(n.status, NotificationStatus::Failed);
    }
}

#[tokio::test]
async fn test_callback_log_promoted_after_delivery() {
    let mut config = business();
    config.callback_config = Some(CallbackConfig {
        service_name: "orders".to_string(),
        retry_policy: None,
    });
    let h = harness(
        config,
        ScriptedProvider::always_ok("sms-a"),
        ScriptedProvider::always_ok("mail-a"),
    );

    let response = h
        .pipeline
        .send(make_notification(1, "k"), &CancellationToken::new())
        .await
        .unwrap();
    let log = h.repo.callback_log(response.notification_id).await.unwrap();
    assert_eq!(log.status, CallbackLogStatus::Pending);
}

// ============================================================
// Deferred strategies
// ============================================================

#[tokio::test]
async fn test_deferred_strategies_only_persist() {
    let h = healthy();
    let now = Utc::now();
    let strategies = [
        SendStrategy::Delayed { delay_seconds: 30 },
        SendStrategy::Scheduled {
            send_at: now + chrono::Duration::minutes(5),
        },
        SendStrategy::TimeWindow {
            start_ms: now.timestamp_millis() + 1_000,
            end_ms: now.timestamp_millis() + 60_000,
        },
        SendStrategy::Deadline {
            deadline: now + chrono::Duration::hours(2),
        },
    ];

    for (i, strategy) in strategies.into_iter().enumerate() {
        let mut n = make_notification(1, &format!("deferred-{i}"));
        n.strategy = strategy;
        let response = h.pipeline.send(n, &CancellationToken::new()).await.unwrap();
        assert_eq!(response.status, NotificationStatus::Pending);
    }

    assert_eq!(h.repo.len().await, 4);
    assert_eq!(h.sms.calls(), 0);
}

#[tokio::test]
async fn test_time_window_end_before_start_rejected() {
    let h = healthy();
    let now = Utc::now().timestamp_millis();
    let mut n = make_notification(1, "window");
    n.strategy = SendStrategy::TimeWindow {
        start_ms: now + 10_000,
        end_ms: now + 5_000,
    };

    let err = h
        .pipeline
        .send(n, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidParameter(_)));
    assert!(h.repo.is_empty().await);
}

#[tokio::test]
async fn test_invalid_batches_rejected() {
    let h = healthy();
    let cancel = CancellationToken::new();

    assert!(matches!(
        h.pipeline.batch_send(Vec::new(), &cancel).await,
        Err(AppError::InvalidParameter(_))
    ));

    let mut delayed = make_notification(1, "b");
    delayed.strategy = SendStrategy::Delayed { delay_seconds: 5 };
    assert!(matches!(
        h.pipeline
            .batch_send(vec![make_notification(1, "a"), delayed], &cancel)
            .await,
        Err(AppError::InvalidParameter(_))
    ));
    assert!(h.repo.is_empty().await);
}
