use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use herald_common::error::{AppError, AppResult};
use herald_common::types::{BatchSendResponse, Notification, NotificationStatus, SendResponse};

use super::{DeliveryStrategy, persist, persist_batch, prepare};
use crate::business_config::BusinessConfigService;
use crate::repository::NotificationRepository;

/// Delayed, scheduled, time-window and deadline notifications: persisted as
/// `Pending` for the scanner, never sent here.
pub struct DeferredStrategy {
    repository: Arc<dyn NotificationRepository>,
    configs: Arc<dyn BusinessConfigService>,
}

impl DeferredStrategy {
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        configs: Arc<dyn BusinessConfigService>,
    ) -> Self {
        Self {
            repository,
            configs,
        }
    }
}

#[async_trait]
impl DeliveryStrategy for DeferredStrategy {
    async fn send(
        &self,
        mut notification: Notification,
        _cancel: &CancellationToken,
    ) -> AppResult<SendResponse> {
        prepare(&mut notification, NotificationStatus::Pending, Utc::now())?;
        let config = self.configs.get_by_id(notification.biz_id).await?;

        match persist(self.repository.as_ref(), &notification, config.wants_callback()).await {
            Ok(created) => {
                tracing::info!(
                    notification_id = %created.id,
                    biz_id = created.biz_id,
                    strategy = %created.strategy.kind(),
                    scheduled_start = %created.scheduled_start,
                    scheduled_end = %created.scheduled_end,
                    "Notification scheduled"
                );
                Ok(created.response())
            }
            Err(AppError::DuplicateKey { biz_id, key }) => {
                let existing = self.repository.get_by_key(biz_id, &key).await?;
                tracing::debug!(
                    notification_id = %existing.id,
                    biz_id,
                    "Duplicate deferred submission, returning stored record"
                );
                Ok(existing.response())
            }
            Err(e) => Err(e),
        }
    }

    async fn batch_send(
        &self,
        mut notifications: Vec<Notification>,
        _cancel: &CancellationToken,
    ) -> AppResult<BatchSendResponse> {
        let now = Utc::now();
        for n in &mut notifications {
            prepare(n, NotificationStatus::Pending, now)?;
        }
        let Some(first) = notifications.first() else {
            return Ok(BatchSendResponse::default());
        };
        let config = self.configs.get_by_id(first.biz_id).await?;

        let created =
            persist_batch(self.repository.as_ref(), &notifications, config.wants_callback()).await?;
        tracing::info!(biz_id = config.id, count = created.len(), "Notifications scheduled");

        Ok(BatchSendResponse::from_results(
            created.iter().map(Notification::response).collect(),
        ))
    }
}
