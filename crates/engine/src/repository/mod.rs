//! Notification persistence.
//!
//! Every status change goes through a version-checked compare-and-swap, so
//! concurrent writers (duplicate submissions, the sender's reconciliation, an
//! external scanner) can never silently overwrite each other.

mod memory;
mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herald_common::error::AppResult;
use herald_common::types::{Notification, NotificationStatus};

pub use memory::MemoryNotificationRepository;
pub use postgres::PgNotificationRepository;

/// State of the result callback owed to the business for one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum CallbackLogStatus {
    /// Written with the notification; nothing to report yet.
    Init,
    /// The notification reached a terminal status; the callback may be sent.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackLog {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub retry_count: i32,
    pub next_retry_at: DateTime<Utc>,
    pub status: CallbackLogStatus,
}

impl CallbackLog {
    pub fn new(notification_id: Uuid) -> Self {
        Self {
            id: Uuid::now_v7(),
            notification_id,
            retry_count: 0,
            next_retry_at: Utc::now(),
            status: CallbackLogStatus::Init,
        }
    }
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Insert one notification. Fails with `DuplicateKey` if `(biz_id, key)`
    /// already exists.
    async fn create(&self, notification: &Notification) -> AppResult<Notification>;

    /// Insert one notification and its callback log atomically.
    async fn create_with_callback_log(&self, notification: &Notification)
    -> AppResult<Notification>;

    /// Insert all notifications or none.
    async fn batch_create(&self, notifications: &[Notification]) -> AppResult<Vec<Notification>>;

    async fn batch_create_with_callback_log(
        &self,
        notifications: &[Notification],
    ) -> AppResult<Vec<Notification>>;

    /// Look a notification up by its idempotency key, or `NotificationNotFound`.
    async fn get_by_key(&self, biz_id: i64, key: &str) -> AppResult<Notification>;

    /// Current state of every id that exists; missing ids are left out.
    async fn batch_get_by_ids(&self, ids: &[Uuid]) -> AppResult<HashMap<Uuid, Notification>>;

    /// Move `id` to `status` if it still carries `expected_version`. Returns the
    /// new version.
    async fn cas_status(
        &self,
        id: Uuid,
        expected_version: i32,
        status: NotificationStatus,
    ) -> AppResult<i32>;

    /// Persist final outcomes. Each row is written only if its stored version
    /// still equals the `version` carried by the given notification; the ids
    /// that lost that race are returned untouched. Callback logs of written rows
    /// are promoted to `Pending`.
    async fn batch_update_status_succeeded_or_failed(
        &self,
        succeeded: &[Notification],
        failed: &[Notification],
    ) -> AppResult<Vec<Uuid>>;
}
