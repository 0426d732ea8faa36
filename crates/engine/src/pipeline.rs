//! Wires the delivery chain together:
//! strategy -> sender -> channel -> provider.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use herald_common::config::ProviderEndpoint;
use herald_common::error::AppResult;
use herald_common::types::{BatchSendResponse, Channel, Notification, SendResponse};

use crate::business_config::BusinessConfigService;
use crate::channel::{ChannelDispatcher, ChannelSelector};
use crate::provider::{
    HttpProvider, LoadBalancerConfig, Provider, ProviderDispatcher, ProviderLoadBalancer,
};
use crate::quota::QuotaService;
use crate::repository::NotificationRepository;
use crate::sender::{Sender, SenderConfig};
use crate::strategy::SendStrategyDispatcher;

pub struct DeliveryPipeline {
    strategies: SendStrategyDispatcher,
    channels: Arc<ChannelDispatcher>,
    providers: Arc<ProviderDispatcher>,
}

impl DeliveryPipeline {
    pub fn new(
        repository: Arc<dyn NotificationRepository>,
        configs: Arc<dyn BusinessConfigService>,
        quota: Arc<dyn QuotaService>,
        providers: ProviderDispatcher,
        sender_config: SenderConfig,
    ) -> Self {
        let providers = Arc::new(providers);
        let channels = Arc::new(ChannelDispatcher::new(
            ChannelSelector::new(configs.clone()),
            providers.clone(),
        ));
        let sender = Arc::new(Sender::new(
            repository.clone(),
            configs.clone(),
            quota,
            channels.clone(),
            sender_config,
        ));

        Self {
            strategies: SendStrategyDispatcher::new(repository, configs, sender),
            channels,
            providers,
        }
    }

    pub async fn send(
        &self,
        notification: Notification,
        cancel: &CancellationToken,
    ) -> AppResult<SendResponse> {
        self.strategies.send(notification, cancel).await
    }

    pub async fn batch_send(
        &self,
        notifications: Vec<Notification>,
        cancel: &CancellationToken,
    ) -> AppResult<BatchSendResponse> {
        self.strategies.batch_send(notifications, cancel).await
    }

    /// Start the recovery loop of every provider balancer.
    pub fn spawn_health_monitors(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.providers.spawn_health_monitors(cancel)
    }

    /// Forget cached channel lists of a business after its config changed.
    pub async fn invalidate_business(&self, biz_id: i64) {
        self.channels.selector().invalidate(biz_id).await;
    }

    pub fn providers(&self) -> &ProviderDispatcher {
        &self.providers
    }
}

/// One HTTP provider per endpoint, balanced per channel.
pub fn providers_from_endpoints(
    endpoints: &[ProviderEndpoint],
    config: LoadBalancerConfig,
) -> AppResult<ProviderDispatcher> {
    let mut by_channel: BTreeMap<String, (Channel, Vec<Arc<dyn Provider>>)> = BTreeMap::new();
    for endpoint in endpoints {
        let provider: Arc<dyn Provider> = Arc::new(HttpProvider::new(endpoint)?);
        by_channel
            .entry(endpoint.channel.to_string())
            .or_insert_with(|| (endpoint.channel, Vec::new()))
            .1
            .push(provider);
    }

    Ok(by_channel
        .into_iter()
        .fold(ProviderDispatcher::new(), |dispatcher, (label, (channel, providers))| {
            tracing::info!(channel = %label, providers = providers.len(), "Provider balancer configured");
            let balancer = ProviderLoadBalancer::new(label, providers, config.clone());
            dispatcher.with_balancer(channel, Arc::new(balancer))
        }))
}
