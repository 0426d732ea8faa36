use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use herald_common::error::{AppError, AppResult};
use herald_common::types::{Notification, SendResponse};

use super::Provider;
use super::health::{DEFAULT_BITMAP_WORDS, TrackedProvider};

/// Configuration for provider health tracking and recovery.
#[derive(Debug, Clone)]
pub struct LoadBalancerConfig {
    /// 64-bit words in each provider's failure ring
    pub bitmap_words: usize,
    /// Interval between recovery probes of unhealthy providers
    pub health_check_interval: Duration,
    /// Upper bound for one recovery probe
    pub health_check_timeout: Duration,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            bitmap_words: DEFAULT_BITMAP_WORDS,
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(3),
        }
    }
}

/// Round-robin balancer over the providers of one channel.
///
/// An atomic counter picks the starting provider for each call; the scan then
/// walks every provider at most once, skipping unhealthy ones, and returns the
/// first successful response. The provider list is fixed at construction.
pub struct ProviderLoadBalancer {
    label: String,
    providers: Vec<Arc<TrackedProvider>>,
    next_index: AtomicUsize,
    config: LoadBalancerConfig,
}

impl ProviderLoadBalancer {
    pub fn new(
        label: impl Into<String>,
        providers: Vec<Arc<dyn Provider>>,
        config: LoadBalancerConfig,
    ) -> Self {
        let providers = providers
            .into_iter()
            .map(|p| Arc::new(TrackedProvider::new(p, config.bitmap_words)))
            .collect();
        Self {
            label: label.into(),
            providers,
            next_index: AtomicUsize::new(0),
            config,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn providers(&self) -> &[Arc<TrackedProvider>] {
        &self.providers
    }

    pub fn healthy_count(&self) -> usize {
        self.providers.iter().filter(|p| p.is_healthy()).count()
    }

    /// Send through the next healthy provider, failing over on error.
    pub async fn send(&self, notification: &Notification) -> AppResult<SendResponse> {
        if self.providers.is_empty() {
            return Err(AppError::NoProvidersAvailable);
        }

        let count = self.providers.len();
        let start = self.next_index.fetch_add(1, Ordering::Relaxed) % count;
        let mut attempted = 0usize;

        for offset in 0..count {
            let provider = &self.providers[(start + offset) % count];
            if !provider.is_healthy() {
                continue;
            }
            attempted += 1;

            match provider.send(notification).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::debug!(
                        balancer = %self.label,
                        provider = %provider.name(),
                        notification_id = %notification.id,
                        error = %e,
                        "Provider failed, trying next"
                    );
                }
            }
        }

        if attempted == 0 {
            tracing::warn!(balancer = %self.label, providers = count, "No healthy provider");
            Err(AppError::NoHealthyProvider)
        } else {
            Err(AppError::NoProvidersAvailable)
        }
    }

    /// Probe every unhealthy provider once. Returns how many were reinstated.
    pub async fn probe_unhealthy(&self) -> usize {
        let timeout = self.config.health_check_timeout;
        let probes = self
            .providers
            .iter()
            .filter(|p| !p.is_healthy())
            .map(|p| p.probe(timeout));
        join_all(probes).await.into_iter().filter(|ok| *ok).count()
    }

    /// Recovery loop: probe unhealthy providers every `interval` until cancelled.
    pub async fn monitor_health(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reinstated = self.probe_unhealthy().await;
                    if reinstated > 0 {
                        tracing::info!(
                            balancer = %self.label,
                            reinstated,
                            healthy = self.healthy_count(),
                            "Health monitor reinstated providers"
                        );
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!(balancer = %self.label, "Health monitor shutting down");
                    break;
                }
            }
        }
    }

    /// Spawn [`Self::monitor_health`] with the configured interval.
    pub fn spawn_health_monitor(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let balancer = Arc::clone(self);
        let interval = self.config.health_check_interval;
        tokio::spawn(async move { balancer.monitor_health(interval, cancel).await })
    }
}
