//! Relay transport (spec §4.2, §4.3): a long-lived relay pool plus the
//! subscription-durability layer built on top of it.

pub mod pool;
pub mod subscription;

pub use pool::{Backoff, PoolResetEvent, RelayPool, RelayStatus};
pub use subscription::SubscriptionManager;
