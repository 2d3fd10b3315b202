//! Live media subscriptions

mod stats;
mod subscriber;

pub use stats::{QueueStatus, SignalStatus, SubscriptionStats, TimeshiftStatus};
pub use subscriber::{Subscriber, SubscriptionListener};
