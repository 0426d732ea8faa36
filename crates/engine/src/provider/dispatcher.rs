use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use herald_common::error::{AppError, AppResult};
use herald_common::types::{Channel, Notification, SendResponse};

use super::Provider;
use super::balancer::ProviderLoadBalancer;

/// Routes a notification to the balancer of its channel.
///
/// Looks and sends like a single [`Provider`] so the channel layer never sees
/// individual vendors.
#[derive(Default)]
pub struct ProviderDispatcher {
    balancers: HashMap<Channel, Arc<ProviderLoadBalancer>>,
}

impl ProviderDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balancer(mut self, channel: Channel, balancer: Arc<ProviderLoadBalancer>) -> Self {
        self.balancers.insert(channel, balancer);
        self
    }

    /// Whether any provider is configured for `channel`.
    pub fn supports(&self, channel: Channel) -> bool {
        self.balancers
            .get(&channel)
            .is_some_and(|b| !b.providers().is_empty())
    }

    pub fn balancer(&self, channel: Channel) -> Option<&Arc<ProviderLoadBalancer>> {
        self.balancers.get(&channel)
    }

    /// Start one health monitor per channel balancer.
    pub fn spawn_health_monitors(
        &self,
        cancel: &CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        self.balancers
            .values()
            .map(|b| b.spawn_health_monitor(cancel.child_token()))
            .collect()
    }
}

#[async_trait]
impl Provider for ProviderDispatcher {
    fn name(&self) -> &str {
        "provider-dispatcher"
    }

    async fn send(&self, notification: &Notification) -> AppResult<SendResponse> {
        match self.balancers.get(&notification.channel) {
            Some(balancer) => balancer.send(notification).await,
            None => Err(AppError::NoProvidersAvailable),
        }
    }

    /// Healthy while at least one channel has a healthy provider.
    async fn check_health(&self) -> AppResult<()> {
        if self.balancers.values().any(|b| b.healthy_count() > 0) {
            Ok(())
        } else {
            Err(AppError::NoHealthyProvider)
        }
    }
}
