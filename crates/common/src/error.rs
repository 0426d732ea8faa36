use thiserror::Error;
use uuid::Uuid;

use crate::lifecycle::TransitionError;
use crate::types::Channel;

pub type AppResult<T> = Result<T, AppError>;

/// Error taxonomy shared by every stage of the delivery pipeline.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Duplicate notification: biz_id={biz_id} key={key}")]
    DuplicateKey { biz_id: i64, key: String },

    #[error("Notification not found: {0}")]
    NotificationNotFound(String),

    #[error("Version conflict on notification {id}: expected version {expected}")]
    VersionConflict { id: Uuid, expected: i32 },

    #[error("Illegal status change on notification {id}: {source}")]
    IllegalTransition {
        id: Uuid,
        #[source]
        source: TransitionError,
    },

    #[error("Send notification failed: {0}")]
    SendNotificationFailed(String),

    #[error("Rate limited: biz_id={biz_id} batch of {requested} exceeds limit {limit}")]
    RateLimited {
        biz_id: i64,
        requested: usize,
        limit: u32,
    },

    #[error("Quota exceeded for biz_id={0}")]
    QuotaExceeded(i64),

    #[error("Business config not found for biz_id={0}")]
    BizConfigNotFound(i64),

    #[error("No available channel")]
    NoAvailableChannel,

    #[error("Channel {channel} send failed: {source}")]
    ChannelSendFailed {
        channel: Channel,
        #[source]
        source: Box<AppError>,
    },

    #[error("No healthy provider")]
    NoHealthyProvider,

    #[error("No providers available")]
    NoProvidersAvailable,

    #[error("Provider {provider} error: {message}")]
    Provider { provider: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the failure belongs to one notification (reported as a FAILED
    /// response) rather than to the whole batch.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            AppError::NoAvailableChannel
                | AppError::ChannelSendFailed { .. }
                | AppError::NoHealthyProvider
                | AppError::NoProvidersAvailable
                | AppError::Provider { .. }
        )
    }

    /// Map a refused lifecycle transition on notification `id`.
    pub fn transition(id: Uuid, err: TransitionError) -> Self {
        match err {
            TransitionError::VersionConflict { expected, .. } => {
                AppError::VersionConflict { id, expected }
            }
            illegal @ TransitionError::Illegal { .. } => AppError::IllegalTransition {
                id,
                source: illegal,
            },
        }
    }

    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }
}
