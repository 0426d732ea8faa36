use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use herald_common::error::{AppError, AppResult};
use herald_common::lifecycle;
use herald_common::types::{Channel, Notification, NotificationStatus, SendStrategy, Template};

use super::{CallbackLog, NotificationRepository};

#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: Uuid,
    biz_id: i64,
    key: String,
    receivers: Json<Vec<String>>,
    channel: Channel,
    template_id: i64,
    template_version_id: i64,
    template_params: Json<HashMap<String, String>>,
    strategy: Json<SendStrategy>,
    scheduled_start: DateTime<Utc>,
    scheduled_end: DateTime<Utc>,
    status: NotificationStatus,
    retry_count: i32,
    version: i32,
}

impl From<NotificationRow> for Notification {
    fn from(row: NotificationRow) -> Self {
        Self {
            id: row.id,
            biz_id: row.biz_id,
            key: row.key,
            receivers: row.receivers.0,
            channel: row.channel,
            template: Template {
                id: row.template_id,
                version_id: row.template_version_id,
                params: row.template_params.0,
            },
            strategy: row.strategy.0,
            scheduled_start: row.scheduled_start,
            scheduled_end: row.scheduled_end,
            status: row.status,
            retry_count: row.retry_count.max(0) as u32,
            version: row.version,
        }
    }
}

const SELECT_NOTIFICATION: &str = r#"
    SELECT id, biz_id, key, receivers, channel, template_id, template_version_id,
           template_params, strategy, scheduled_start, scheduled_end, status,
           retry_count, version
    FROM notifications
"#;

/// Status strings a row must currently hold to move to `desired`.
fn predecessor_names(desired: NotificationStatus) -> Vec<String> {
    lifecycle::predecessors(desired)
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn map_insert_error(err: sqlx::Error, notification: &Notification) -> AppError {
    if let sqlx::Error::Database(db_err) = &err
        && db_err.is_unique_violation()
    {
        return AppError::DuplicateKey {
            biz_id: notification.biz_id,
            key: notification.key.clone(),
        };
    }
    err.into()
}

/// Postgres-backed repository over the `notifications` and `callback_logs`
/// tables.
pub struct PgNotificationRepository {
    pool: PgPool,
}

impl PgNotificationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(conn: &mut PgConnection, n: &Notification) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, biz_id, key, receivers, channel, template_id, template_version_id,
                template_params, strategy, scheduled_start, scheduled_end, status,
                retry_count, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(n.id)
        .bind(n.biz_id)
        .bind(&n.key)
        .bind(Json(&n.receivers))
        .bind(n.channel)
        .bind(n.template.id)
        .bind(n.template.version_id)
        .bind(Json(&n.template.params))
        .bind(Json(&n.strategy))
        .bind(n.scheduled_start)
        .bind(n.scheduled_end)
        .bind(n.status)
        .bind(n.retry_count as i32)
        .bind(n.version)
        .execute(conn)
        .await
        .map_err(|e| map_insert_error(e, n))?;
        Ok(())
    }

    async fn insert_callback_log(conn: &mut PgConnection, log: &CallbackLog) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO callback_logs (id, notification_id, retry_count, next_retry_at, status)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(log.id)
        .bind(log.notification_id)
        .bind(log.retry_count)
        .bind(log.next_retry_at)
        .bind(log.status)
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn create_all(
        &self,
        notifications: &[Notification],
        with_callback_log: bool,
    ) -> AppResult<Vec<Notification>> {
        let mut tx = self.pool.begin().await?;
        for n in notifications {
            Self::insert(&mut *tx, n).await?;
            if with_callback_log {
                Self::insert_callback_log(&mut *tx, &CallbackLog::new(n.id)).await?;
            }
        }
        tx.commit().await?;

        tracing::debug!(
            count = notifications.len(),
            with_callback_log,
            "Notifications created"
        );
        Ok(notifications.to_vec())
    }

    /// Explain why a conditional update touched no row.
    async fn conflict_for(
        &self,
        id: Uuid,
        expected_version: i32,
        status: NotificationStatus,
    ) -> AppResult<AppError> {
        let current: Option<(NotificationStatus, i32)> =
            sqlx::query_as("SELECT status, version FROM notifications WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(match current {
            None => AppError::NotificationNotFound(id.to_string()),
            Some((current, version)) => {
                match lifecycle::transition(current, version, status, expected_version) {
                    Err(e) => AppError::transition(id, e),
                    // The row moved back between the two statements.
                    Ok(_) => AppError::VersionConflict {
                        id,
                        expected: expected_version,
                    },
                }
            }
        })
    }
}

#[async_trait]
impl NotificationRepository for PgNotificationRepository {
    async fn create(&self, notification: &Notification) -> AppResult<Notification> {
        let mut conn = self.pool.acquire().await?;
        Self::insert(&mut *conn, notification).await?;
        Ok(notification.clone())
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
        let row: Option<NotificationRow> =
            sqlx::query_as(&format!("{SELECT_NOTIFICATION} WHERE biz_id = $1 AND key = $2"))
                .bind(biz_id)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Notification::from)
            .ok_or_else(|| AppError::NotificationNotFound(format!("biz_id={biz_id} key={key}")))
    }

    async fn batch_get_by_ids(&self, ids: &[Uuid]) -> AppResult<HashMap<Uuid, Notification>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<NotificationRow> =
            sqlx::query_as(&format!("{SELECT_NOTIFICATION} WHERE id = ANY($1)"))
                .bind(ids)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.id, Notification::from(row)))
            .collect())
    }

    async fn cas_status(
        &self,
        id: Uuid,
        expected_version: i32,
        status: NotificationStatus,
    ) -> AppResult<i32> {
        let new_version: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE notifications
            SET status = $1, version = version + 1, updated_at = NOW()
            WHERE id = $2 AND version = $3 AND status = ANY($4)
            RETURNING version
            "#,
        )
        .bind(status)
        .bind(id)
        .bind(expected_version)
        .bind(predecessor_names(status))
        .fetch_optional(&self.pool)
        .await?;

        match new_version {
            Some(version) => Ok(version),
            None => Err(self.conflict_for(id, expected_version, status).await?),
        }
    }

    async fn batch_update_status_succeeded_or_failed(
        &self,
        succeeded: &[Notification],
        failed: &[Notification],
    ) -> AppResult<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;
        let mut written = Vec::with_capacity(succeeded.len() + failed.len());
        let mut conflicts = Vec::new();

        let outcomes = succeeded
            .iter()
            .map(|n| (n, NotificationStatus::Succeeded))
            .chain(failed.iter().map(|n| (n, NotificationStatus::Failed)));
        for (n, status) in outcomes {
            let result = sqlx::query(
                r#"
                UPDATE notifications
                SET status = $1, retry_count = $2, version = version + 1, updated_at = NOW()
                WHERE id = $3 AND version = $4 AND status = ANY($5)
                "#,
            )
            .bind(status)
            .bind(n.retry_count as i32)
            .bind(n.id)
            .bind(n.version)
            .bind(predecessor_names(status))
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                conflicts.push(n.id);
            } else {
                written.push(n.id);
            }
        }

        if !written.is_empty() {
            sqlx::query(
                r#"
                UPDATE callback_logs
                SET status = 'pending', updated_at = NOW()
                WHERE notification_id = ANY($1) AND status = 'init'
                "#,
            )
            .bind(&written)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(conflicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::make_notification;

    #[test]
    fn test_predecessor_names_match_column_values() {
        assert_eq!(
            predecessor_names(NotificationStatus::Sending),
            vec!["prepare", "pending", "failed"]
        );
        assert_eq!(predecessor_names(NotificationStatus::Succeeded), vec!["sending"]);
    }

    #[test]
    fn test_row_conversion() {
        let n = make_notification(7, "row");
        let row = NotificationRow {
            id: n.id,
            biz_id: n.biz_id,
            key: n.key.clone(),
            receivers: Json(n.receivers.clone()),
            channel: n.channel,
            template_id: n.template.id,
            template_version_id: n.template.version_id,
            template_params: Json(n.template.params.clone()),
            strategy: Json(n.strategy.clone()),
            scheduled_start: n.scheduled_start,
            scheduled_end: n.scheduled_end,
            status: n.status,
            retry_count: -3,
            version: n.version,
        };
        let converted = Notification::from(row);
        assert_eq!(converted.retry_count, 0);
        assert_eq!(converted.template, n.template);
        assert_eq!(converted.strategy, n.strategy);
    }
}
