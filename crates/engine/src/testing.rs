//! Test doubles for driving the pipeline without real vendors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use herald_common::error::{AppError, AppResult};
use herald_common::types::{
    Channel, Notification, NotificationStatus, SendResponse, SendStrategy, Template,
};

use crate::provider::{LoadBalancerConfig, Provider, ProviderDispatcher, ProviderLoadBalancer};

/// Build an immediate SMS notification for `biz_id` / `key`.
pub fn make_notification(biz_id: i64, key: &str) -> Notification {
    Notification::new(
        biz_id,
        key,
        vec!["+15550100".to_string()],
        Channel::Sms,
        Template {
            id: 100,
            version_id: 1,
            params: HashMap::from([("code".to_string(), "4321".to_string())]),
        },
        SendStrategy::Immediate,
    )
}

/// Build a dispatcher with one balancer per listed channel.
pub fn dispatcher_with(channels: &[(Channel, Vec<Arc<ScriptedProvider>>)]) -> ProviderDispatcher {
    channels
        .iter()
        .fold(ProviderDispatcher::new(), |dispatcher, (channel, providers)| {
            let providers = providers
                .iter()
                .map(|p| p.clone() as Arc<dyn Provider>)
                .collect();
            let balancer =
                ProviderLoadBalancer::new(channel.to_string(), providers, LoadBalancerConfig::default());
            dispatcher.with_balancer(*channel, Arc::new(balancer))
        })
}

/// A provider whose outcomes are scripted by the test.
pub struct ScriptedProvider {
    name: String,
    failing: AtomicBool,
    /// Calls that fail before `failing` takes over.
    fail_first: AtomicUsize,
    probe_ok: AtomicBool,
    probe_delay_ms: AtomicU64,
    send_delay_ms: AtomicU64,
    calls: AtomicUsize,
    probes: AtomicUsize,
    sent: Mutex<Vec<Uuid>>,
}

impl ScriptedProvider {
    fn with_failing(name: &str, failing: bool) -> Self {
        Self {
            name: name.to_string(),
            failing: AtomicBool::new(failing),
            fail_first: AtomicUsize::new(0),
            probe_ok: AtomicBool::new(true),
            probe_delay_ms: AtomicU64::new(0),
            send_delay_ms: AtomicU64::new(0),
            calls: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn always_ok(name: &str) -> Self {
        Self::with_failing(name, false)
    }

    pub fn always_failing(name: &str) -> Self {
        Self::with_failing(name, true)
    }

    /// Fails the first `n` calls, then succeeds.
    pub fn failing_first(name: &str, n: usize) -> Self {
        let provider = Self::with_failing(name, false);
        provider.fail_first.store(n, Ordering::SeqCst);
        provider
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_probe_ok(&self, ok: bool) {
        self.probe_ok.store(ok, Ordering::SeqCst);
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        self.probe_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        self.send_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Total send calls, failed or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Ids of notifications this provider delivered successfully.
    pub fn sent_ids(&self) -> Vec<Uuid> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> AppResult<SendResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.send_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let scripted_failure = self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure || self.failing.load(Ordering::SeqCst) {
            return Err(AppError::provider(&self.name, "scripted failure"));
        }

        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(notification.id);
        Ok(SendResponse {
            notification_id: notification.id,
            status: NotificationStatus::Succeeded,
            retry_count: 0,
        })
    }

    async fn check_health(&self) -> AppResult<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let delay = self.probe_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.probe_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::provider(&self.name, "probe failed"))
        }
    }
}
