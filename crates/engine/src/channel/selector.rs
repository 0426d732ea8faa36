use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use herald_common::error::{AppError, AppResult};
use herald_common::types::{BusinessConfig, Channel, Notification, RetryPolicy};

use crate::business_config::BusinessConfigService;

/// A candidate channel together with the retry policy to use on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedChannel {
    pub channel: Channel,
    pub retry_policy: RetryPolicy,
}

/// Progress of one notification through its candidate channels.
///
/// Owned by the caller, so one selector serves any number of notifications
/// concurrently.
#[derive(Debug, Clone, Default)]
pub struct SelectionState {
    attempted: HashSet<Channel>,
    cursor: usize,
}

impl SelectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempted(&self) -> &HashSet<Channel> {
        &self.attempted
    }
}

/// Produces the ordered failover list for a notification and walks it.
///
/// Candidates are the notification's own channel followed by every other
/// enabled channel of the business (by ascending priority), without
/// duplicates. Lists are cached per `(biz_id, channel)`.
pub struct ChannelSelector {
    configs: Arc<dyn BusinessConfigService>,
    cache: RwLock<HashMap<(i64, Channel), Arc<[SelectedChannel]>>>,
}

impl ChannelSelector {
    pub fn new(configs: Arc<dyn BusinessConfigService>) -> Self {
        Self {
            configs,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Next unattempted candidate, or `NoAvailableChannel` once exhausted.
    pub async fn next(
        &self,
        notification: &Notification,
        state: &mut SelectionState,
    ) -> AppResult<SelectedChannel> {
        let candidates = self.candidates(notification).await?;

        while let Some(candidate) = candidates.get(state.cursor) {
            state.cursor += 1;
            if state.attempted.insert(candidate.channel) {
                return Ok(candidate.clone());
            }
        }

        Err(AppError::NoAvailableChannel)
    }

    /// Cached candidate list for the notification's `(biz_id, channel)`.
    pub async fn candidates(&self, notification: &Notification) -> AppResult<Arc<[SelectedChannel]>> {
        let key = (notification.biz_id, notification.channel);
        if let Some(cached) = self.cache.read().await.get(&key) {
            return Ok(Arc::clone(cached));
        }

        let config = self.configs.get_by_id(notification.biz_id).await?;
        let candidates: Arc<[SelectedChannel]> =
            build_candidates(notification.channel, &config).into();

        self.cache
            .write()
            .await
            .insert(key, Arc::clone(&candidates));
        Ok(candidates)
    }

    /// Drop cached lists for a business after its config changed.
    pub async fn invalidate(&self, biz_id: i64) {
        self.cache.write().await.retain(|(id, _), _| *id != biz_id);
    }
}

fn build_candidates(primary: Channel, config: &BusinessConfig) -> Vec<SelectedChannel> {
    let mut channels = vec![primary];

    if let Some(channel_config) = &config.channel_config {
        let mut items: Vec<_> = channel_config.channels.iter().filter(|i| i.enabled).collect();
        items.sort_by_key(|i| i.priority);
        for item in items {
            if !channels.contains(&item.channel) {
                channels.push(item.channel);
            }
        }
    }

    channels
        .into_iter()
        .map(|channel| SelectedChannel {
            channel,
            retry_policy: config.retry_policy_for(channel),
        })
        .collect()
}
