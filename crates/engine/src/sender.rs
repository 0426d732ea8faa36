//! Batch sender: admission control, concurrent delivery, and reconciliation of
//! the outcomes against the stored records.

use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use herald_common::error::{AppError, AppResult};
use herald_common::types::{BusinessConfig, Notification, NotificationStatus, SendResponse};

use crate::business_config::BusinessConfigService;
use crate::channel::ChannelDispatcher;
use crate::quota::QuotaService;
use crate::repository::NotificationRepository;
use crate::worker_pool::WorkerPool;

const DEFAULT_WORKERS: usize = 32;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct SenderConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Reject batches larger than the business's rate limit (`0` disables it).
pub fn check_rate_limit(config: &BusinessConfig, requested: usize) -> AppResult<()> {
    if config.rate_limit > 0 && requested > config.rate_limit as usize {
        return Err(AppError::RateLimited {
            biz_id: config.id,
            requested,
            limit: config.rate_limit,
        });
    }
    Ok(())
}

pub struct Sender {
    repository: Arc<dyn NotificationRepository>,
    configs: Arc<dyn BusinessConfigService>,
    quota: Arc<dyn QuotaService>,
    pool: WorkerPool,
}

impl Sender {
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        configs: Arc<dyn BusinessConfigService>,
        quota: Arc<dyn QuotaService>,
        dispatcher: Arc<ChannelDispatcher>,
        config: SenderConfig,
    ) -> Self {
        Self {
            repository,
            configs,
            quota,
            pool: WorkerPool::new(dispatcher, config.workers, config.queue_capacity),
        }
    }

    /// Deliver a batch of notifications of one business.
    ///
    /// Admission failures (`RateLimited`, `QuotaExceeded`, missing config) fail
    /// the whole batch before anything is sent. Delivery failures are reported
    /// per notification as `Failed` responses. Successes come first.
    pub async fn send(
        &self,
        notifications: Vec<Notification>,
        cancel: &CancellationToken,
    ) -> AppResult<Vec<SendResponse>> {
        let Some(first) = notifications.first() else {
            return Ok(Vec::new());
        };
        let biz_id = first.biz_id;
        if notifications.iter().any(|n| n.biz_id != biz_id) {
            return Err(AppError::InvalidParameter(
                "a batch must belong to a single business".to_string(),
            ));
        }

        let config = self.configs.get_by_id(biz_id).await?;
        check_rate_limit(&config, notifications.len())?;
        if !self.quota.admit(&config, &notifications).await? {
            return Err(AppError::QuotaExceeded(biz_id));
        }

        let (succeeded, failed) = self.deliver(notifications, cancel).await?;
        self.reconcile(&succeeded, &failed).await?;

        tracing::info!(
            biz_id,
            succeeded = succeeded.len(),
            failed = failed.len(),
            "Batch delivered"
        );

        Ok(succeeded
            .iter()
            .map(|n| response(n, NotificationStatus::Succeeded))
            .chain(failed.iter().map(|n| response(n, NotificationStatus::Failed)))
            .collect())
    }

    /// Fan the batch out to the workers and split the outcomes.
    async fn deliver(
        &self,
        notifications: Vec<Notification>,
        cancel: &CancellationToken,
    ) -> AppResult<(Vec<Notification>, Vec<Notification>)> {
        let mut replies = Vec::with_capacity(notifications.len());
        for n in &notifications {
            replies.push(self.pool.submit(n.clone(), cancel.child_token()).await?);
        }

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (original, reply) in notifications.into_iter().zip(join_all(replies).await) {
            match reply {
                Ok(outcome) => match outcome.result {
                    Ok(_) => succeeded.push(outcome.notification),
                    Err(e) => {
                        tracing::warn!(
                            notification_id = %outcome.notification.id,
                            biz_id = outcome.notification.biz_id,
                            retry_count = outcome.notification.retry_count,
                            error = %e,
                            "Notification delivery failed"
                        );
                        failed.push(outcome.notification);
                    }
                },
                Err(_) => {
                    tracing::error!(
                        notification_id = %original.id,
                        "Sender worker dropped notification"
                    );
                    failed.push(original);
                }
            }
        }

        Ok((succeeded, failed))
    }

    /// Write final statuses against the currently stored versions.
    async fn reconcile(&self, succeeded: &[Notification], failed: &[Notification]) -> AppResult<()> {
        let ids: Vec<Uuid> = succeeded.iter().chain(failed).map(|n| n.id).collect();
        let current = self.repository.batch_get_by_ids(&ids).await?;

        let stamp = |batch: &[Notification]| -> Vec<Notification> {
            batch
                .iter()
                .filter_map(|n| match current.get(&n.id) {
                    Some(stored) => {
                        let mut n = n.clone();
                        n.version = stored.version;
                        Some(n)
                    }
                    None => {
                        tracing::warn!(notification_id = %n.id, "Notification vanished before reconciliation");
                        None
                    }
                })
                .collect()
        };

        let conflicts = self
            .repository
            .batch_update_status_succeeded_or_failed(&stamp(succeeded), &stamp(failed))
            .await?;

        for id in conflicts {
            tracing::warn!(
                notification_id = %id,
                "Status changed concurrently, outcome not persisted"
            );
        }
        Ok(())
    }
}

fn response(notification: &Notification, status: NotificationStatus) -> SendResponse {
    SendResponse {
        notification_id: notification.id,
        status,
        retry_count: notification.retry_count,
    }
}
