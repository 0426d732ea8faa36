//! Notification delivery pipeline.
//!
//! Requests enter through [`strategy::SendStrategyDispatcher`], which persists
//! them idempotently and hands immediate ones to the [`sender::Sender`]. The
//! sender delivers each notification through [`channel::ChannelDispatcher`]
//! (channel failover with retries), which in turn uses the per-channel
//! [`provider::ProviderLoadBalancer`]s. [`pipeline::DeliveryPipeline`] wires the
//! whole chain.

pub mod business_config;
pub mod channel;
pub mod pipeline;
pub mod provider;
pub mod quota;
pub mod repository;
pub mod sender;
pub mod strategy;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod worker_pool;
