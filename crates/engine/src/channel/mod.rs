//! Channel failover.
//!
//! [`ChannelSelector`] decides which channels a notification may use and in
//! what order; [`ChannelDispatcher`] walks them, retrying each under its retry
//! policy before moving on.

pub mod dispatcher;
pub mod selector;

pub use dispatcher::ChannelDispatcher;
pub use selector::{ChannelSelector, SelectedChannel, SelectionState};
