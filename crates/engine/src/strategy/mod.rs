//! Top of the pipeline: decide when a notification may be sent, persist it
//! idempotently, and hand immediate ones to the [`Sender`](crate::sender::Sender).

mod deferred;
mod immediate;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use herald_common::error::{AppError, AppResult};
use herald_common::types::{
    BatchSendResponse, Notification, NotificationStatus, SendResponse, SendStrategyType,
};

use crate::business_config::BusinessConfigService;
use crate::repository::NotificationRepository;
use crate::sender::Sender;

pub use deferred::DeferredStrategy;
pub use immediate::ImmediateStrategy;

#[async_trait]
pub trait DeliveryStrategy: Send + Sync {
    async fn send(
        &self,
        notification: Notification,
        cancel: &CancellationToken,
    ) -> AppResult<SendResponse>;

    /// All notifications share one strategy type and one business.
    async fn batch_send(
        &self,
        notifications: Vec<Notification>,
        cancel: &CancellationToken,
    ) -> AppResult<BatchSendResponse>;
}

/// Routes each request to the strategy named by its notifications.
pub struct SendStrategyDispatcher {
    immediate: ImmediateStrategy,
    deferred: DeferredStrategy,
}

impl SendStrategyDispatcher {
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        configs: Arc<dyn BusinessConfigService>,
        sender: Arc<Sender>,
    ) -> Self {
        Self {
            immediate: ImmediateStrategy::new(repository.clone(), configs.clone(), sender),
            deferred: DeferredStrategy::new(repository, configs),
        }
    }

    fn strategy_for(&self, kind: SendStrategyType) -> &dyn DeliveryStrategy {
        match kind {
            SendStrategyType::Immediate => &self.immediate,
            SendStrategyType::Delayed
            | SendStrategyType::Scheduled
            | SendStrategyType::TimeWindow
            | SendStrategyType::Deadline => &self.deferred,
        }
    }

    pub async fn send(
        &self,
        notification: Notification,
        cancel: &CancellationToken,
    ) -> AppResult<SendResponse> {
        self.strategy_for(notification.strategy.kind())
            .send(notification, cancel)
            .await
    }

    pub async fn batch_send(
        &self,
        notifications: Vec<Notification>,
        cancel: &CancellationToken,
    ) -> AppResult<BatchSendResponse> {
        let Some(first) = notifications.first() else {
            return Err(AppError::InvalidParameter("empty batch".to_string()));
        };
        let kind = first.strategy.kind();
        let biz_id = first.biz_id;

        if let Some(other) = notifications.iter().find(|n| n.strategy.kind() != kind) {
            return Err(AppError::InvalidParameter(format!(
                "batch mixes send strategies {kind} and {}",
                other.strategy.kind()
            )));
        }
        if notifications.iter().any(|n| n.biz_id != biz_id) {
            return Err(AppError::InvalidParameter(
                "batch mixes businesses".to_string(),
            ));
        }

        self.strategy_for(kind).batch_send(notifications, cancel).await
    }
}

/// Validate, compute the send window, and reset lifecycle fields for a fresh
/// record in `status`.
fn prepare(notification: &mut Notification, status: NotificationStatus, now: DateTime<Utc>) -> AppResult<()> {
    notification.validate()?;
    notification.apply_send_window(now)?;
    notification.status = status;
    notification.retry_count = 0;
    notification.version = 1;
    Ok(())
}

async fn persist(
    repository: &dyn NotificationRepository,
    notification: &Notification,
    with_callback_log: bool,
) -> AppResult<Notification> {
    if with_callback_log {
        repository.create_with_callback_log(notification).await
    } else {
        repository.create(notification).await
    }
}

async fn persist_batch(
    repository: &dyn NotificationRepository,
    notifications: &[Notification],
    with_callback_log: bool,
) -> AppResult<Vec<Notification>> {
    if with_callback_log {
        repository.batch_create_with_callback_log(notifications).await
    } else {
        repository.batch_create(notifications).await
    }
}
