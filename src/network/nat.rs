//! NAT port-mapping manager
//!
//! Every mapping is backed by a firewall forwarding rule. Creation applies
//! the rule first and only persists the row once the firewall accepted it;
//! removal is the other way around and never fails on firewall errors.

use super::firewall::{FirewallApplier, ForwardRule};
use crate::config::NatConfig;
use crate::error::{NetplaneError, Resource, Result};
use crate::quota::QuotaManager;
use crate::store::{BindingStatus, OwnerId, PortMapping, Protocol, Store};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Result of a bulk range allocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RangeOutcome {
    pub created: Vec<PortMapping>,
    /// External ports that were already taken or whose rule failed
    pub skipped: Vec<u16>,
}

/// Result of a firewall reconciliation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub applied: usize,
    pub failed: usize,
}

/// Parse `"a-b"` or a single `"a"` into an inclusive port range
pub fn parse_port_range(range: &str) -> Result<(u16, u16)> {
    let range = range.trim();
    let (start, end) = match range.split_once('-') {
        Some((start, end)) => (parse_port(start)?, parse_port(end)?),
        None => {
            let port = parse_port(range)?;
            (port, port)
        }
    };

    if start > end {
        return Err(NetplaneError::InvalidPort(format!(
            "range start {} is after range end {}",
            start, end
        )));
    }
    Ok((start, end))
}

fn parse_port(port: &str) -> Result<u16> {
    let port = port.trim();
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(NetplaneError::InvalidPort(port.to_string())),
        Ok(port) => Ok(port),
    }
}

fn check_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(NetplaneError::InvalidPort("0".to_string()));
    }
    Ok(())
}

fn parse_target(target: &str) -> Result<IpAddr> {
    target
        .trim()
        .parse()
        .map_err(|_| NetplaneError::InvalidAddress(target.to_string()))
}

/// Last port of a run of `count` ports starting at `start`
fn range_end(start: u16, count: u16) -> Result<u16> {
    let end = start as u32 + count as u32 - 1;
    u16::try_from(end)
        .map_err(|_| NetplaneError::InvalidPort(format!("{} ports from {} overflow the port space", count, start)))
}

/// Port-forwarding manager
pub struct NatManager {
    store: Arc<dyn Store>,
    quotas: Arc<QuotaManager>,
    firewall: Arc<dyn FirewallApplier>,
    config: NatConfig,
    lock: Mutex<()>,
}

impl NatManager {
    pub fn new(
        store: Arc<dyn Store>,
        quotas: Arc<QuotaManager>,
        firewall: Arc<dyn FirewallApplier>,
        config: NatConfig,
    ) -> Self {
        Self {
            store,
            quotas,
            firewall,
            config,
            lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| NetplaneError::Lock("Failed to acquire NAT lock".to_string()))
    }

    fn port_taken(&self, port: u16, protocol: Protocol) -> Result<bool> {
        Ok(self
            .store
            .port_mappings()
            .count(&|m| m.is_active() && m.external_port == port && m.protocol == protocol)?
            > 0)
    }

    /// Apply the rule, then persist. Must be called with the NAT lock held.
    fn create_locked(
        &self,
        owner: OwnerId,
        target: IpAddr,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        description: &str,
    ) -> Result<PortMapping> {
        let rule = ForwardRule::new(protocol, external_port, target, internal_port);
        self.firewall.apply(&rule)?;

        let mapping = PortMapping {
            id: 0,
            owner,
            target_address: target,
            protocol,
            external_port,
            internal_port,
            description: description.to_string(),
            status: BindingStatus::Active,
            created_at: Utc::now(),
        };

        match self.store.port_mappings().insert(mapping) {
            Ok(mapping) => {
                debug!("Created port mapping {} for owner {}: {}", mapping.id, owner, rule);
                Ok(mapping)
            }
            Err(e) => {
                if let Err(undo) = self.firewall.remove(&rule) {
                    warn!("Failed to roll back firewall rule {}: {}", rule, undo);
                }
                Err(e)
            }
        }
    }

    /// Map one caller-chosen external port
    pub fn add_mapping(
        &self,
        owner: OwnerId,
        target: &str,
        protocol: Protocol,
        external_port: u16,
        internal_port: u16,
        description: &str,
    ) -> Result<PortMapping> {
        let target = parse_target(target)?;
        check_port(external_port)?;
        check_port(internal_port)?;

        self.quotas.check_port_mapping_quota(owner, 1)?;

        let _guard = self.lock()?;
        if self.port_taken(external_port, protocol)? {
            return Err(NetplaneError::PortInUse {
                port: external_port,
                protocol,
            });
        }

        let mapping = self.create_locked(owner, target, protocol, external_port, internal_port, description)?;
        info!(
            "Mapped {}/{} to {}:{} for owner {}",
            external_port, protocol, target, internal_port, owner
        );
        Ok(mapping)
    }

    /// Map `count` consecutive ports, skipping the ones that cannot be had
    ///
    /// Partial success is normal; callers that need every port must compare
    /// `created.len()` with `count`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_range(
        &self,
        owner: OwnerId,
        target: &str,
        protocol: Protocol,
        external_start: u16,
        internal_start: u16,
        count: u16,
        description: &str,
    ) -> Result<RangeOutcome> {
        let target = parse_target(target)?;
        check_port(external_start)?;
        check_port(internal_start)?;
        if count == 0 {
            return Err(NetplaneError::InvalidInput("port count must be at least 1".to_string()));
        }
        let external_end = range_end(external_start, count)?;
        range_end(internal_start, count)?;

        self.quotas.check_port_mapping_quota(owner, count as u64)?;

        let description = format!("{} (range {}-{})", description, external_start, external_end)
            .trim_start()
            .to_string();

        let _guard = self.lock()?;
        let mut outcome = RangeOutcome::default();

        for offset in 0..count {
            let external = external_start + offset;
            let internal = internal_start + offset;

            if self.port_taken(external, protocol)? {
                debug!("Skipping {}/{}: already mapped", external, protocol);
                outcome.skipped.push(external);
                continue;
            }

            match self.create_locked(owner, target, protocol, external, internal, &description) {
                Ok(mapping) => outcome.created.push(mapping),
                Err(e) => {
                    warn!("Skipping {}/{}: {}", external, protocol, e);
                    outcome.skipped.push(external);
                }
            }
        }

        info!(
            "Mapped {} of {} ports {}-{}/{} to {} for owner {}",
            outcome.created.len(),
            count,
            external_start,
            external_end,
            protocol,
            target,
            owner
        );
        Ok(outcome)
    }

    /// Map a random free port from the ephemeral range
    pub fn add_random(
        &self,
        owner: OwnerId,
        target: &str,
        protocol: Protocol,
        internal_port: u16,
        description: &str,
    ) -> Result<PortMapping> {
        let target = parse_target(target)?;
        check_port(internal_port)?;

        self.quotas.check_port_mapping_quota(owner, 1)?;

        let (start, end) = (self.config.ephemeral_start, self.config.ephemeral_end);
        let attempts = self.config.random_attempts;

        let _guard = self.lock()?;

        let occupied = self.store.port_mappings().count(&|m| {
            m.is_active() && m.protocol == protocol && m.external_port >= start && m.external_port <= end
        })?;
        if occupied >= (end - start) as usize + 1 {
            return Err(NetplaneError::PortExhausted { protocol, attempts: 0 });
        }

        let mut rng = rand::thread_rng();
        for _ in 0..attempts {
            let candidate = rng.gen_range(start..=end);
            if self.port_taken(candidate, protocol)? {
                continue;
            }

            match self.create_locked(owner, target, protocol, candidate, internal_port, description) {
                Ok(mapping) => {
                    info!(
                        "Mapped random port {}/{} to {}:{} for owner {}",
                        candidate, protocol, target, internal_port, owner
                    );
                    return Ok(mapping);
                }
                Err(e) => warn!("Random port {}/{} rejected: {}", candidate, protocol, e),
            }
        }

        Err(NetplaneError::PortExhausted { protocol, attempts })
    }

    /// Remove one mapping and its rule
    pub fn remove_mapping(&self, mapping_id: u64) -> Result<PortMapping> {
        let mapping = {
            let _guard = self.lock()?;
            let mapping = self
                .store
                .port_mappings()
                .get(mapping_id)?
                .ok_or_else(|| NetplaneError::not_found("port mapping", mapping_id))?;

            self.remove_locked(&mapping)?;
            mapping
        };

        self.quotas.released(mapping.owner, Resource::PortMapping, 1);
        info!(
            "Removed port mapping {} ({}/{}) of owner {}",
            mapping.id, mapping.external_port, mapping.protocol, mapping.owner
        );
        Ok(mapping)
    }

    fn remove_locked(&self, mapping: &PortMapping) -> Result<()> {
        if mapping.is_active() {
            let rule = ForwardRule::from(mapping);
            if let Err(e) = self.firewall.remove(&rule) {
                warn!("Failed to remove firewall rule {}, leaving it until the next sync: {}", rule, e);
            }
        }
        self.store.port_mappings().delete(mapping.id)?;
        Ok(())
    }

    /// Remove every mapping of an owner
    pub fn remove_owner_mappings(&self, owner: OwnerId) -> Result<usize> {
        let removed = {
            let _guard = self.lock()?;
            let mappings = self.store.port_mappings().find(&|m| m.owner == owner)?;
            for mapping in &mappings {
                self.remove_locked(mapping)?;
            }
            mappings.len()
        };

        self.quotas.released(owner, Resource::PortMapping, removed);
        Ok(removed)
    }

    /// Flush managed rules and re-apply every active mapping
    pub fn sync_rules(&self) -> Result<SyncReport> {
        let _guard = self.lock()?;
        self.firewall.clear_managed()?;

        let mut report = SyncReport::default();
        for mapping in self.store.port_mappings().find(&|m| m.is_active())? {
            let rule = ForwardRule::from(&mapping);
            match self.firewall.apply(&rule) {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!("Failed to restore rule for mapping {}: {}", mapping.id, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Synced firewall: {} rules applied, {} failed",
            report.applied, report.failed
        );
        Ok(report)
    }

    pub fn mappings_for(&self, owner: OwnerId) -> Result<Vec<PortMapping>> {
        self.store.port_mappings().find(&|m| m.owner == owner)
    }

    pub fn list(&self) -> Result<Vec<PortMapping>> {
        self.store.port_mappings().find(&|_| true)
    }

    pub fn get(&self, mapping_id: u64) -> Result<PortMapping> {
        self.store
            .port_mappings()
            .get(mapping_id)?
            .ok_or_else(|| NetplaneError::not_found("port mapping", mapping_id))
    }

    /// Whether no active mapping holds `port`/`protocol`
    pub fn is_port_available(&self, port: u16, protocol: Protocol) -> Result<bool> {
        Ok(!self.port_taken(port, protocol)?)
    }

    pub fn active_count(&self) -> Result<usize> {
        self.store.port_mappings().count(&|m| m.is_active())
    }
}
