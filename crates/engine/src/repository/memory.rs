use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use herald_common::error::{AppError, AppResult};
use herald_common::lifecycle;
use herald_common::types::{Notification, NotificationStatus};

use super::{CallbackLog, CallbackLogStatus, NotificationRepository};

#[derive(Default)]
struct Store {
    notifications: HashMap<Uuid, Notification>,
    keys: HashMap<(i64, String), Uuid>,
    callback_logs: HashMap<Uuid, CallbackLog>,
}

impl Store {
    fn check_unique(&self, notifications: &[Notification]) -> AppResult<()> {
        let mut seen = std::collections::HashSet::new();
        for n in notifications {
            let key = (n.biz_id, n.key.clone());
            if self.keys.contains_key(&key) || !seen.insert(key) {
                return Err(AppError::DuplicateKey {
                    biz_id: n.biz_id,
                    key: n.key.clone(),
                });
            }
        }
        Ok(())
    }

    fn insert(&mut self, notifications: &[Notification], with_callback_log: bool) {
        for n in notifications {
            self.keys.insert((n.biz_id, n.key.clone()), n.id);
            self.notifications.insert(n.id, n.clone());
            if with_callback_log {
                self.callback_logs.insert(n.id, CallbackLog::new(n.id));
            }
        }
    }

    fn apply(&mut self, id: Uuid, expected_version: i32, status: NotificationStatus) -> AppResult<&mut Notification> {
        let stored = self
            .notifications
            .get_mut(&id)
            .ok_or_else(|| AppError::NotificationNotFound(id.to_string()))?;
        let version = lifecycle::transition(stored.status, stored.version, status, expected_version)
            .map_err(|e| AppError::transition(id, e))?;
        stored.status = status;
        stored.version = version;
        Ok(stored)
    }
}

/// Process-local repository with the same contract as the Postgres one.
#[derive(Default)]
pub struct MemoryNotificationRepository {
    store: Mutex<Store>,
}

impl MemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.store.lock().await.notifications.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get(&self, id: Uuid) -> Option<Notification> {
        self.store.lock().await.notifications.get(&id).cloned()
    }

    pub async fn callback_log(&self, notification_id: Uuid) -> Option<CallbackLog> {
        self.store
            .lock()
            .await
            .callback_logs
            .get(&notification_id)
            .cloned()
    }

    async fn create_all(
        &self,
        notifications: &[Notification],
        with_callback_log: bool,
    ) -> AppResult<Vec<Notification>> {
        let mut store = self.store.lock().await;
        store.check_unique(notifications)?;
        store.insert(notifications, with_callback_log);
        Ok(notifications.to_vec())
    }
}

#[async_trait]
impl NotificationRepository for MemoryNotificationRepository {
    async fn create(&self, notification: &Notification) -> AppResult<Notification> {
        let mut created = self
            .create_all(std::slice::from_ref(notification), false)
            .await?;
        created.pop().ok_or_else(|| AppError::Internal("empty insert".to_string()))
    }

    async fn create_with_callback_log(
        &self,
        notification: &Notification,
    ) -> AppResult<Notification> {
        let mut created = self
            .create_all(std::slice::from_ref(notification), true)
            .await?;
        created.pop().ok_or_else(|| AppError::Internal("empty insert".to_string()))
    }

    async fn batch_create(&self, notifications: &[Notification]) -> AppResult<Vec<Notification>> {
        self.create_all(notifications, false).await
    }

    async fn batch_create_with_callback_log(
        &self,
        notifications: &[Notification],
    ) -> AppResult<Vec<Notification>> {
        self.create_all(notifications, true).await
    }

    async fn get_by_key(&self, biz_id: i64, key: &str) -> AppResult<Notification> {
        let store = self.store.lock().await;
        store
            .keys
            .get(&(biz_id, key.to_string()))
            .and_then(|id| store.notifications.get(id))
            .cloned()
            .ok_or_else(|| AppError::NotificationNotFound(format!("biz_id={biz_id} key={key}")))
    }

    async fn batch_get_by_ids(&self, ids: &[Uuid]) -> AppResult<HashMap<Uuid, Notification>> {
        let store = self.store.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| store.notifications.get(id).map(|n| (*id, n.clone())))
            .collect())
    }

    async fn cas_status(
        &self,
        id: Uuid,
        expected_version: i32,
        status: NotificationStatus,
    ) -> AppResult<i32> {
        let mut store = self.store.lock().await;
        Ok(store.apply(id, expected_version, status)?.version)
    }

    async fn batch_update_status_succeeded_or_failed(
        &self,
        succeeded: &[Notification],
        failed: &[Notification],
    ) -> AppResult<Vec<Uuid>> {
        let mut store = self.store.lock().await;
        let mut conflicts = Vec::new();

        let outcomes = succeeded
            .iter()
            .map(|n| (n, NotificationStatus::Succeeded))
            .chain(failed.iter().map(|n| (n, NotificationStatus::Failed)));
        for (n, status) in outcomes {
            match store.apply(n.id, n.version, status) {
                Ok(stored) => stored.retry_count = n.retry_count,
                Err(_) => {
                    conflicts.push(n.id);
                    continue;
                }
            }
            if let Some(log) = store.callback_logs.get_mut(&n.id)
                && log.status == CallbackLogStatus::Init
            {
                log.status = CallbackLogStatus::Pending;
            }
        }

        Ok(conflicts)
    }
}
