//! Quota manager
//!
//! Usage is never cached: every check counts the owner's live rows in the
//! store and compares `usage + requested` against the limit.

use super::lifecycle::ContainerLifecycle;
use crate::error::{NetplaneError, Resource, Result};
use crate::store::{AddressStatus, Limit, OveragePolicy, OwnerId, Quota, Store};
use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Live usage next to the configured limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub owner: OwnerId,
    pub addresses_used: u64,
    pub port_mappings_used: u64,
    pub proxies_used: u64,
    pub traffic_used: u64,
    pub quota: Quota,
}

/// Partial quota update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaUpdate {
    pub address_quota: Option<Limit>,
    pub port_mapping_quota: Option<Limit>,
    pub proxy_quota: Option<Limit>,
    pub traffic_quota: Option<Limit>,
    pub overage_policy: Option<OveragePolicy>,
}

/// Limits applied to quotas that were never configured
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaDefaults {
    pub address_quota: Limit,
    pub port_mapping_quota: Limit,
    pub proxy_quota: Limit,
    pub traffic_quota: Limit,
}

/// Aggregate figures across all owners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStats {
    pub total: usize,
    pub traffic_exceeded: usize,
}

/// One calendar month after `at`
pub fn one_month_after(at: DateTime<Utc>) -> DateTime<Utc> {
    at.checked_add_months(Months::new(1))
        .unwrap_or_else(|| at + Duration::days(30))
}

/// Per-owner quota bookkeeping and enforcement
pub struct QuotaManager {
    store: Arc<dyn Store>,
    lifecycle: Arc<dyn ContainerLifecycle>,
    lock: Mutex<()>,
}

impl QuotaManager {
    pub fn new(store: Arc<dyn Store>, lifecycle: Arc<dyn ContainerLifecycle>) -> Self {
        Self {
            store,
            lifecycle,
            lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| NetplaneError::Lock("Failed to acquire quota lock".to_string()))
    }

    /// Must be called with the quota lock held
    fn get_or_create_locked(&self, owner: OwnerId, now: DateTime<Utc>) -> Result<Quota> {
        if let Some(quota) = self.store.quotas().first(&|q| q.owner == owner)? {
            return Ok(quota);
        }

        let quota = self
            .store
            .quotas()
            .insert(Quota::unlimited(owner, one_month_after(now)))?;
        debug!("Created default quota for owner {}", owner);
        Ok(quota)
    }

    /// Existing quota for `owner`, or a new all-unlimited one
    pub fn get_or_create(&self, owner: OwnerId) -> Result<Quota> {
        let _guard = self.lock()?;
        self.get_or_create_locked(owner, Utc::now())
    }

    /// Quota for `owner` if one exists
    pub fn get(&self, owner: OwnerId) -> Result<Option<Quota>> {
        self.store.quotas().first(&|q| q.owner == owner)
    }

    /// All quotas
    pub fn list(&self) -> Result<Vec<Quota>> {
        self.store.quotas().find(&|_| true)
    }

    /// Change limits or policy
    pub fn update(&self, owner: OwnerId, update: QuotaUpdate) -> Result<Quota> {
        let _guard = self.lock()?;
        let mut quota = self.get_or_create_locked(owner, Utc::now())?;

        if let Some(limit) = update.address_quota {
            quota.address_quota = limit;
        }
        if let Some(limit) = update.port_mapping_quota {
            quota.port_mapping_quota = limit;
        }
        if let Some(limit) = update.proxy_quota {
            quota.proxy_quota = limit;
        }
        if let Some(limit) = update.traffic_quota {
            quota.traffic_quota = limit;
        }
        if let Some(policy) = update.overage_policy {
            quota.overage_policy = policy;
        }

        self.store.quotas().update(&quota)?;
        info!("Updated quota of owner {}", owner);
        Ok(quota)
    }

    /// Delete an owner's quota
    pub fn delete(&self, owner: OwnerId) -> Result<()> {
        let _guard = self.lock()?;
        let removed = self.store.quotas().delete_where(&|q| q.owner == owner)?;
        if removed == 0 {
            return Err(NetplaneError::not_found("quota", owner));
        }
        Ok(())
    }

    /// Apply `defaults` to every quota whose limits are all unlimited
    pub fn apply_defaults(&self, defaults: QuotaDefaults) -> Result<usize> {
        let _guard = self.lock()?;
        let untouched = self.store.quotas().find(&|q| {
            q.address_quota.is_unlimited()
                && q.port_mapping_quota.is_unlimited()
                && q.proxy_quota.is_unlimited()
                && q.traffic_quota.is_unlimited()
        })?;

        for mut quota in untouched.iter().cloned() {
            quota.address_quota = defaults.address_quota;
            quota.port_mapping_quota = defaults.port_mapping_quota;
            quota.proxy_quota = defaults.proxy_quota;
            quota.traffic_quota = defaults.traffic_quota;
            self.store.quotas().update(&quota)?;
        }

        Ok(untouched.len())
    }

    /// Live usage counts for one owner
    pub fn usage(&self, owner: OwnerId) -> Result<QuotaUsage> {
        let quota = self.get_or_create(owner)?;
        self.usage_of(quota, Utc::now())
    }

    fn usage_of(&self, quota: Quota, now: DateTime<Utc>) -> Result<QuotaUsage> {
        let owner = quota.owner;
        Ok(QuotaUsage {
            owner,
            addresses_used: self.live_count(owner, Resource::Address)?,
            port_mappings_used: self.live_count(owner, Resource::PortMapping)?,
            proxies_used: self.live_count(owner, Resource::Proxy)?,
            traffic_used: quota.traffic_in_period(now),
            quota,
        })
    }

    fn live_count(&self, owner: OwnerId, resource: Resource) -> Result<u64> {
        let count = match resource {
            Resource::Address => self
                .store
                .addresses()
                .count(&|a| a.owner == Some(owner) && a.status == AddressStatus::Used)?,
            Resource::PortMapping => self
                .store
                .port_mappings()
                .count(&|m| m.owner == owner && m.is_active())?,
            Resource::Proxy => self
                .store
                .proxy_routes()
                .count(&|r| r.owner == owner && r.is_active())?,
            Resource::Traffic => 0,
        };
        Ok(count as u64)
    }

    fn check(&self, owner: OwnerId, resource: Resource, requested: u64) -> Result<()> {
        let _guard = self.lock()?;
        let now = Utc::now();
        let quota = self.get_or_create_locked(owner, now)?;

        let limit = match resource {
            Resource::Address => quota.address_quota,
            Resource::PortMapping => quota.port_mapping_quota,
            Resource::Proxy => quota.proxy_quota,
            Resource::Traffic => quota.traffic_quota,
        };

        if let Limit::Limited(max) = limit {
            let current = self.live_count(owner, resource)?;
            if !limit.allows(current, requested) {
                return Err(NetplaneError::QuotaExceeded {
                    resource,
                    current,
                    requested,
                    limit: max,
                });
            }
        }

        // limit/stop owners lose new allocations once the period's traffic is spent
        if quota.overage_policy != OveragePolicy::Warn && quota.traffic_exhausted(now) {
            return Err(traffic_exceeded(&quota, now));
        }

        Ok(())
    }

    /// Gate `requested` new addresses
    pub fn check_address_quota(&self, owner: OwnerId, requested: u64) -> Result<()> {
        self.check(owner, Resource::Address, requested)
    }

    /// Gate `requested` new port mappings
    pub fn check_port_mapping_quota(&self, owner: OwnerId, requested: u64) -> Result<()> {
        self.check(owner, Resource::PortMapping, requested)
    }

    /// Gate `requested` new proxy routes
    pub fn check_proxy_quota(&self, owner: OwnerId, requested: u64) -> Result<()> {
        self.check(owner, Resource::Proxy, requested)
    }

    /// Fail when the current period's traffic is spent, whatever the policy
    pub fn check_traffic_quota(&self, owner: OwnerId) -> Result<()> {
        let _guard = self.lock()?;
        let now = Utc::now();
        let quota = self.get_or_create_locked(owner, now)?;
        if quota.traffic_exhausted(now) {
            return Err(traffic_exceeded(&quota, now));
        }
        Ok(())
    }

    /// Record `delta` bytes of traffic
    pub fn add_traffic_usage(&self, owner: OwnerId, delta: u64) -> Result<Quota> {
        self.add_traffic_usage_at(owner, delta, Utc::now())
    }

    /// Record traffic as of `now`
    ///
    /// A passed reset date zeroes usage and moves the reset date to one
    /// month after `now` before the delta is added. Missed periods are not
    /// caught up one by one.
    pub fn add_traffic_usage_at(&self, owner: OwnerId, delta: u64, now: DateTime<Utc>) -> Result<Quota> {
        let quota = {
            let _guard = self.lock()?;
            let mut quota = self.get_or_create_locked(owner, now)?;

            if now > quota.traffic_reset_at {
                debug!("Traffic period of owner {} rolled over", owner);
                quota.traffic_used = 0;
                quota.traffic_reset_at = one_month_after(now);
            }
            quota.traffic_used = quota.traffic_used.saturating_add(delta);

            self.store.quotas().update(&quota)?;
            quota
        };

        if let Limit::Limited(max) = quota.traffic_quota {
            if quota.traffic_used >= max {
                self.dispatch_overage(&quota, max);
            }
        }

        Ok(quota)
    }

    /// Runs on every traffic report that leaves usage at or over the limit.
    /// Under the stop policy the same owner is stopped again on each report,
    /// so `ContainerLifecycle::stop` must be idempotent.
    fn dispatch_overage(&self, quota: &Quota, max: u64) {
        match quota.overage_policy {
            OveragePolicy::Warn => {
                warn!(
                    "Owner {} exceeded traffic quota ({} / {} bytes)",
                    quota.owner, quota.traffic_used, max
                );
            }
            OveragePolicy::Limit => {
                warn!(
                    "Owner {} reached traffic quota ({} / {} bytes), new allocations are rejected",
                    quota.owner, quota.traffic_used, max
                );
            }
            OveragePolicy::Stop => {
                warn!(
                    "Owner {} exceeded traffic quota ({} / {} bytes), stopping workload",
                    quota.owner, quota.traffic_used, max
                );
                if let Err(e) = self.lifecycle.stop(quota.owner) {
                    error!("Failed to stop workload of owner {}: {}", quota.owner, e);
                }
            }
        }
    }

    /// Zero the owner's traffic and start a fresh period
    pub fn reset_traffic(&self, owner: OwnerId) -> Result<Quota> {
        let _guard = self.lock()?;
        let now = Utc::now();
        let mut quota = self.get_or_create_locked(owner, now)?;
        quota.traffic_used = 0;
        quota.traffic_reset_at = one_month_after(now);
        self.store.quotas().update(&quota)?;
        info!("Reset traffic of owner {}", owner);
        Ok(quota)
    }

    /// Notification that `count` resources of an owner were released
    pub fn released(&self, owner: OwnerId, resource: Resource, count: usize) {
        if count == 0 {
            return;
        }
        match self.live_count(owner, resource) {
            Ok(in_use) => debug!(
                "Owner {} released {} {} (now {} in use)",
                owner, count, resource, in_use
            ),
            Err(e) => warn!("Failed to recount {} usage of owner {}: {}", resource, owner, e),
        }
    }

    /// Totals across all owners
    pub fn stats(&self) -> Result<QuotaStats> {
        let now = Utc::now();
        let quotas = self.list()?;
        Ok(QuotaStats {
            total: quotas.len(),
            traffic_exceeded: quotas.iter().filter(|q| q.traffic_exhausted(now)).count(),
        })
    }
}

fn traffic_exceeded(quota: &Quota, now: DateTime<Utc>) -> NetplaneError {
    let limit = match quota.traffic_quota {
        Limit::Limited(max) => max,
        Limit::Unlimited => u64::MAX,
    };
    NetplaneError::QuotaExceeded {
        resource: Resource::Traffic,
        current: quota.traffic_in_period(now),
        requested: 0,
        limit,
    }
}
