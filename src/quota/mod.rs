//! Quota management
//!
//! Tracks per-owner limits and traffic, gates allocations in the network
//! managers, and dispatches the overage policy.

pub mod lifecycle;
pub mod manager;

pub use lifecycle::{CommandLifecycle, ContainerLifecycle, RecordingLifecycle};
pub use manager::{one_month_after, QuotaDefaults, QuotaManager, QuotaStats, QuotaUpdate, QuotaUsage};
