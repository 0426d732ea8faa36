//! Vendor providers and the layers that balance and health-track them.
//!
//! ```text
//! ProviderDispatcher ── channel ──► ProviderLoadBalancer ──► TrackedProvider ──► dyn Provider
//! ```

pub mod balancer;
pub mod dispatcher;
pub mod health;
pub mod http;

use async_trait::async_trait;

use herald_common::error::AppResult;
use herald_common::types::{Notification, SendResponse};

pub use balancer::{LoadBalancerConfig, ProviderLoadBalancer};
pub use dispatcher::ProviderDispatcher;
pub use health::{HealthBitmap, TrackedProvider};
pub use http::HttpProvider;

/// A vendor integration able to deliver on one channel.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable name used in logs.
    fn name(&self) -> &str;

    /// Deliver one notification.
    async fn send(&self, notification: &Notification) -> AppResult<SendResponse>;

    /// Cheap liveness probe used to reinstate an unhealthy provider.
    async fn check_health(&self) -> AppResult<()>;
}
