use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use herald_common::error::{AppError, AppResult};
use herald_common::types::{Notification, NotificationStatus, SendResponse};

use super::selector::{ChannelSelector, SelectedChannel, SelectionState};
use crate::provider::{Provider, ProviderDispatcher};

/// Delivers one notification, failing over across channels.
///
/// Each channel is tried up to its retry policy's attempt count, with a
/// cancellable backoff between attempts. Channels without configured
/// providers are skipped.
pub struct ChannelDispatcher {
    selector: ChannelSelector,
    providers: Arc<ProviderDispatcher>,
}

impl ChannelDispatcher {
    pub fn new(selector: ChannelSelector, providers: Arc<ProviderDispatcher>) -> Self {
        Self {
            selector,
            providers,
        }
    }

    pub fn selector(&self) -> &ChannelSelector {
        &self.selector
    }

    /// Deliver `notification`, adding every attempt after the first to its
    /// `retry_count`.
    pub async fn send(
        &self,
        notification: &mut Notification,
        cancel: &CancellationToken,
    ) -> AppResult<SendResponse> {
        let mut attempts = 0u32;
        let result = self.deliver(notification, &mut attempts, cancel).await;
        notification.retry_count += attempts.saturating_sub(1);

        result.map(|mut response| {
            response.status = NotificationStatus::Succeeded;
            response.retry_count = notification.retry_count;
            response
        })
    }

    async fn deliver(
        &self,
        notification: &Notification,
        attempts: &mut u32,
        cancel: &CancellationToken,
    ) -> AppResult<SendResponse> {
        let mut state = SelectionState::new();
        let mut last_error: Option<AppError> = None;

        loop {
            let selected = match self.selector.next(notification, &mut state).await {
                Ok(selected) => selected,
                Err(AppError::NoAvailableChannel) => {
                    tracing::warn!(
                        notification_id = %notification.id,
                        biz_id = notification.biz_id,
                        channels_tried = state.attempted().len(),
                        last_error = ?last_error.as_ref().map(ToString::to_string),
                        "All channels exhausted"
                    );
                    return Err(AppError::NoAvailableChannel);
                }
                Err(e) => return Err(e),
            };

            if !self.providers.supports(selected.channel) {
                tracing::debug!(
                    notification_id = %notification.id,
                    channel = %selected.channel,
                    "No providers for channel, skipping"
                );
                continue;
            }

            match self
                .send_on_channel(notification, &selected, attempts, cancel)
                .await
            {
                Ok(response) => return Ok(response),
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    tracing::warn!(
                        notification_id = %notification.id,
                        channel = %selected.channel,
                        error = %e,
                        "Channel exhausted, failing over"
                    );
                    last_error = Some(e);
                }
            }
        }
    }

    /// Try one channel under its retry policy.
    async fn send_on_channel(
        &self,
        notification: &Notification,
        selected: &SelectedChannel,
        attempts: &mut u32,
        cancel: &CancellationToken,
    ) -> AppResult<SendResponse> {
        let mut attempt_notification = notification.clone();
        attempt_notification.channel = selected.channel;

        let policy = &selected.retry_policy;
        let mut last_error = None;

        for attempt in 0..policy.attempts() {
            if attempt > 0 {
                backoff(policy.interval(attempt as usize - 1), cancel).await?;
            } else if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            *attempts += 1;
            match self.providers.send(&attempt_notification).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::debug!(
                        notification_id = %notification.id,
                        channel = %selected.channel,
                        attempt = attempt + 1,
                        max_attempts = policy.attempts(),
                        error = %e,
                        "Delivery attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(AppError::ChannelSendFailed {
            channel: selected.channel,
            source: Box::new(last_error.unwrap_or(AppError::NoProvidersAvailable)),
        })
    }
}

/// Wait `delay`, or return `Cancelled` as soon as the token fires.
async fn backoff(delay: Duration, cancel: &CancellationToken) -> AppResult<()> {
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(AppError::Cancelled),
    }
}
