use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use herald_common::error::{AppError, AppResult};
use herald_common::types::{BatchSendResponse, Notification, NotificationStatus, SendResponse};

use super::{DeliveryStrategy, persist, persist_batch, prepare};
use crate::business_config::BusinessConfigService;
use crate::repository::NotificationRepository;
use crate::sender::{Sender, check_rate_limit};

/// Persist straight into `Sending` and deliver synchronously.
pub struct ImmediateStrategy {
    repository: Arc<dyn NotificationRepository>,
    configs: Arc<dyn BusinessConfigService>,
    sender: Arc<Sender>,
}

impl ImmediateStrategy {
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        configs: Arc<dyn BusinessConfigService>,
        sender: Arc<Sender>,
    ) -> Self {
        Self {
            repository,
            configs,
            sender,
        }
    }

    async fn send_one(
        &self,
        notification: Notification,
        cancel: &CancellationToken,
    ) -> AppResult<SendResponse> {
        let id = notification.id;
        self.send_claimed(vec![notification], cancel)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Internal(format!("no send result for notification {id}")))
    }

    /// Send records this request holds in `Sending`. If the sender rejects the
    /// batch, the records are moved to `Failed` so a resubmission can claim
    /// them again.
    async fn send_claimed(
        &self,
        notifications: Vec<Notification>,
        cancel: &CancellationToken,
    ) -> AppResult<Vec<SendResponse>> {
        let claims: Vec<(Uuid, i32)> = notifications.iter().map(|n| (n.id, n.version)).collect();

        match self.sender.send(notifications, cancel).await {
            Ok(responses) => Ok(responses),
            Err(e) => {
                self.release(&claims, &e).await;
                Err(e)
            }
        }
    }

    async fn release(&self, claims: &[(Uuid, i32)], cause: &AppError) {
        for &(id, version) in claims {
            match self
                .repository
                .cas_status(id, version, NotificationStatus::Failed)
                .await
            {
                Ok(_) => tracing::warn!(
                    notification_id = %id,
                    error = %cause,
                    "Send rejected, notification released as failed"
                ),
                Err(e) => tracing::warn!(
                    notification_id = %id,
                    error = %e,
                    "Could not release rejected notification"
                ),
            }
        }
    }

    /// A record with this key already exists: decide whether it still needs
    /// delivering, and if so claim it before sending the stored payload.
    async fn resend_existing(
        &self,
        biz_id: i64,
        key: &str,
        cancel: &CancellationToken,
    ) -> AppResult<SendResponse> {
        let mut stored = self.repository.get_by_key(biz_id, key).await?;

        match stored.status {
            NotificationStatus::Succeeded => {
                tracing::info!(
                    notification_id = %stored.id,
                    biz_id,
                    "Duplicate of delivered notification, not resending"
                );
                Ok(stored.response())
            }
            NotificationStatus::Sending => Err(AppError::SendNotificationFailed(format!(
                "notification {} is already being sent",
                stored.id
            ))),
            _ => {
                stored.version = self
                    .repository
                    .cas_status(stored.id, stored.version, NotificationStatus::Sending)
                    .await?;
                stored.status = NotificationStatus::Sending;

                tracing::info!(
                    notification_id = %stored.id,
                    biz_id,
                    retry_count = stored.retry_count,
                    "Resending stored notification"
                );
                self.send_one(stored, cancel).await
            }
        }
    }
}

#[async_trait]
impl DeliveryStrategy for ImmediateStrategy {
    async fn send(
        &self,
        mut notification: Notification,
        cancel: &CancellationToken,
    ) -> AppResult<SendResponse> {
        prepare(&mut notification, NotificationStatus::Sending, Utc::now())?;
        let config = self.configs.get_by_id(notification.biz_id).await?;

        match persist(self.repository.as_ref(), &notification, config.wants_callback()).await {
            Ok(created) => {
                tracing::debug!(
                    notification_id = %created.id,
                    biz_id = created.biz_id,
                    "Notification created for immediate send"
                );
                self.send_one(created, cancel).await
            }
            Err(AppError::DuplicateKey { biz_id, key }) => {
                self.resend_existing(biz_id, &key, cancel).await
            }
            Err(e) => Err(e),
        }
    }

    async fn batch_send(
        &self,
        mut notifications: Vec<Notification>,
        cancel: &CancellationToken,
    ) -> AppResult<BatchSendResponse> {
        let now = Utc::now();
        for n in &mut notifications {
            prepare(n, NotificationStatus::Sending, now)?;
        }
        let Some(first) = notifications.first() else {
            return Ok(BatchSendResponse::default());
        };
        let config = self.configs.get_by_id(first.biz_id).await?;
        check_rate_limit(&config, notifications.len())?;

        let created =
            persist_batch(self.repository.as_ref(), &notifications, config.wants_callback()).await?;
        let results = self.send_claimed(created, cancel).await?;

        Ok(BatchSendResponse::from_results(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::business_config::StaticBusinessConfigService;
    use crate::channel::{ChannelDispatcher, ChannelSelector};
    use crate::quota::UnlimitedQuota;
    use crate::repository::MemoryNotificationRepository;
    use crate::sender::SenderConfig;
    use crate::testing::{ScriptedProvider, dispatcher_with, make_notification};
    use herald_common::types::{BusinessConfig, Channel, RetryPolicy};

    struct Fixture {
        strategy: ImmediateStrategy,
        repo: Arc<MemoryNotificationRepository>,
        sms: Arc<ScriptedProvider>,
    }

    fn fixture(sms: ScriptedProvider) -> Fixture {
        let mut config = BusinessConfig::new(1);
        config.rate_limit = 5;
        config.retry_policy = Some(RetryPolicy {
            max_retries: 1,
            intervals_ms: vec![],
        });

        let sms = Arc::new(sms);
        let repo = Arc::new(MemoryNotificationRepository::new());
        let configs = Arc::new(StaticBusinessConfigService::new([config]));
        let dispatcher = Arc::new(ChannelDispatcher::new(
            ChannelSelector::new(configs.clone()),
            Arc::new(dispatcher_with(&[(Channel::Sms, vec![sms.clone()])])),
        ));
        let sender = Arc::new(Sender::new(
            repo.clone(),
            configs.clone(),
            Arc::new(UnlimitedQuota),
            dispatcher,
            SenderConfig::default(),
        ));
        Fixture {
            strategy: ImmediateStrategy::new(repo.clone(), configs, sender),
            repo,
            sms,
        }
    }

    #[tokio::test]
    async fn test_send_delivers_and_persists() {
        let f = fixture(ScriptedProvider::always_ok("sms-a"));
        let response = f
            .strategy
            .send(make_notification(1, "k"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status, NotificationStatus::Succeeded);
        let stored = f.repo.get(response.notification_id).await.unwrap();
        assert_eq!(stored.status, NotificationStatus::Succeeded);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_duplicate_of_succeeded_is_not_resent() {
        let f = fixture(ScriptedProvider::always_ok("sms-a"));
        let cancel = CancellationToken::new();
        let first = f.strategy.send(make_notification(1, "k"), &cancel).await.unwrap();
        let second = f.strategy.send(make_notification(1, "k"), &cancel).await.unwrap();

        assert_eq!(first.notification_id, second.notification_id);
        assert_eq!(second.status, NotificationStatus::Succeeded);
        assert_eq!(f.sms.calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_of_failed_resends_stored_payload() {
        let f = fixture(ScriptedProvider::always_failing("sms-a"));
        let cancel = CancellationToken::new();
        let first = f.strategy.send(make_notification(1, "k"), &cancel).await.unwrap();
        assert_eq!(first.status, NotificationStatus::Failed);

        f.sms.set_failing(false);
        let mut resubmitted = make_notification(1, "k");
        resubmitted.template.params.insert("code".to_string(), "9999".to_string());
        let second = f.strategy.send(resubmitted, &cancel).await.unwrap();

        assert_eq!(second.notification_id, first.notification_id);
        assert_eq!(second.status, NotificationStatus::Succeeded);
        assert_eq!(f.sms.sent_ids(), vec![first.notification_id]);

        let stored = f.repo.get(first.notification_id).await.unwrap();
        assert_eq!(stored.template.params["code"], "4321");
        // created(1) -> failed(2) -> sending(3) -> succeeded(4)
        assert_eq!(stored.version, 4);
    }

    #[tokio::test]
    async fn test_duplicate_while_sending_fails() {
        let f = fixture(ScriptedProvider::always_ok("sms-a"));
        let mut inflight = make_notification(1, "k");
        inflight.status = NotificationStatus::Sending;
        f.repo.create(&inflight).await.unwrap();

        let err = f
            .strategy
            .send(make_notification(1, "k"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SendNotificationFailed(_)));
        assert_eq!(f.sms.calls(), 0);
    }

    #[tokio::test]
    async fn test_batch_over_rate_limit_creates_nothing() {
        let f = fixture(ScriptedProvider::always_ok("sms-a"));
        let batch = (0..6).map(|i| make_notification(1, &format!("k{i}"))).collect();

        let err = f
            .strategy
            .batch_send(batch, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::RateLimited { requested: 6, limit: 5, .. }));
        assert!(f.repo.is_empty().await);
    }

    #[tokio::test]
    async fn test_batch_send() {
        let f = fixture(ScriptedProvider::always_ok("sms-a"));
        let batch = (0..5).map(|i| make_notification(1, &format!("k{i}"))).collect();

        let response = f
            .strategy
            .batch_send(batch, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.total, 5);
        assert_eq!(response.succeeded, 5);
        assert_eq!(f.sms.calls(), 5);
    }
}
