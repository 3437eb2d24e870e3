//! Control plane
//!
//! Builds the four managers once over a shared store and hands them out.
//! Callers get explicit service objects instead of process-wide globals.

use crate::config::NetplaneConfig;
use crate::error::Result;
use crate::exec::CommandRunner;
use crate::network::{
    AddressPool, ConfigSyncReport, FirewallApplier, IptablesFirewall, MemoryFirewall,
    MemoryProxyEngine, NatManager, NginxEngine, ProxyEngine, ProxyLayout, ProxyManager,
    SyncReport,
};
use crate::quota::{CommandLifecycle, ContainerLifecycle, QuotaManager, RecordingLifecycle};
use crate::store::{MemoryStore, OwnerId, Store};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of a startup reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub firewall: SyncReport,
    pub proxy: ConfigSyncReport,
}

/// What `release_owner` tore down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRelease {
    pub port_mappings: usize,
    pub proxy_routes: usize,
    pub addresses: usize,
    /// Steps that failed and were skipped
    pub errors: usize,
}

pub struct ControlPlane {
    store: Arc<dyn Store>,
    quotas: Arc<QuotaManager>,
    pool: AddressPool,
    nat: NatManager,
    proxy: ProxyManager,
}

impl ControlPlane {
    pub fn new(
        store: Arc<dyn Store>,
        firewall: Arc<dyn FirewallApplier>,
        engine: Arc<dyn ProxyEngine>,
        lifecycle: Arc<dyn ContainerLifecycle>,
        config: &NetplaneConfig,
    ) -> Self {
        let quotas = Arc::new(QuotaManager::new(store.clone(), lifecycle));
        let pool = AddressPool::new(store.clone(), quotas.clone(), config.pool.max_range_size);
        let nat = NatManager::new(store.clone(), quotas.clone(), firewall, config.nat.clone());
        let proxy = ProxyManager::new(
            store.clone(),
            quotas.clone(),
            engine,
            ProxyLayout::from(&config.proxy),
        );

        Self {
            store,
            quotas,
            pool,
            nat,
            proxy,
        }
    }

    /// Open the state directory and wire the adapters the config asks for
    pub fn from_config(config: &NetplaneConfig) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn Store> = Arc::new(MemoryStore::open(&config.state_dir)?);

        if config.dry_run {
            info!("Dry run: firewall, proxy engine and workload lifecycle are simulated");
            return Ok(Self::new(
                store,
                Arc::new(MemoryFirewall::new()),
                Arc::new(MemoryProxyEngine::new()),
                Arc::new(RecordingLifecycle::new()),
                config,
            ));
        }

        let runner = CommandRunner::new(config.command_timeout())?;
        let lifecycle = CommandLifecycle::new(runner.clone(), config.lifecycle.stop_command.clone())?;
        Ok(Self::new(
            store,
            Arc::new(IptablesFirewall::new(runner.clone(), config.firewall.clone())),
            Arc::new(NginxEngine::new(runner, config.proxy.nginx_bin.clone())),
            Arc::new(lifecycle),
            config,
        ))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn quotas(&self) -> &QuotaManager {
        &self.quotas
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    pub fn nat(&self) -> &NatManager {
        &self.nat
    }

    pub fn proxy(&self) -> &ProxyManager {
        &self.proxy
    }

    /// Rebuild firewall rules and proxy configuration from the store
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let firewall = self.nat.sync_rules()?;
        let proxy = self.proxy.sync_configs()?;
        Ok(ReconcileReport { firewall, proxy })
    }

    /// Free everything an owner holds, continuing past failures
    pub fn release_owner(&self, owner: OwnerId) -> OwnerRelease {
        let mut release = OwnerRelease::default();

        match self.nat.remove_owner_mappings(owner) {
            Ok(n) => release.port_mappings = n,
            Err(e) => {
                warn!("Failed to remove port mappings of owner {}: {}", owner, e);
                release.errors += 1;
            }
        }
        match self.proxy.remove_owner_routes(owner) {
            Ok(n) => release.proxy_routes = n,
            Err(e) => {
                warn!("Failed to remove proxy routes of owner {}: {}", owner, e);
                release.errors += 1;
            }
        }
        match self.pool.release_all(owner) {
            Ok(n) => release.addresses = n,
            Err(e) => {
                warn!("Failed to release addresses of owner {}: {}", owner, e);
                release.errors += 1;
            }
        }

        info!(
            "Released owner {}: {} mappings, {} routes, {} addresses",
            owner, release.port_mappings, release.proxy_routes, release.addresses
        );
        release
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AddressFamily, Protocol};
    use tempfile::TempDir;

    fn dry_config(dir: &TempDir) -> NetplaneConfig {
        let mut config = NetplaneConfig::default();
        config.dry_run = true;
        config.state_dir = dir.path().join("state");
        config.proxy.available_dir = dir.path().join("available");
        config.proxy.enabled_dir = dir.path().join("enabled");
        config.proxy.log_dir = dir.path().join("log");
        config
    }

    #[test]
    fn test_provision_and_release_owner() {
        let dir = TempDir::new().unwrap();
        let plane = ControlPlane::from_config(&dry_config(&dir)).unwrap();

        plane
            .pool()
            .add_range("10.0.0.10", "10.0.0.20", "10.0.0.1", "255.255.255.0", AddressFamily::Ipv4)
            .unwrap();
        let addr = plane.pool().allocate(AddressFamily::Ipv4, 42).unwrap();
        let target = addr.address.to_string();
        plane
            .nat()
            .add_mapping(42, &target, Protocol::Tcp, 8080, 80, "web")
            .unwrap();
        plane
            .proxy()
            .add_route(42, "app.example.com", &target, 80, false, None, None)
            .unwrap();

        let usage = plane.quotas().usage(42).unwrap();
        assert_eq!(
            (usage.addresses_used, usage.port_mappings_used, usage.proxies_used),
            (1, 1, 1)
        );

        let release = plane.release_owner(42);
        assert_eq!(
            release,
            OwnerRelease {
                port_mappings: 1,
                proxy_routes: 1,
                addresses: 1,
                errors: 0,
            }
        );
        assert_eq!(plane.pool().count_available(AddressFamily::Ipv4).unwrap(), 11);
    }

    #[test]
    fn test_state_survives_restart_and_reconciles() {
        let dir = TempDir::new().unwrap();
        let config = dry_config(&dir);

        {
            let plane = ControlPlane::from_config(&config).unwrap();
            plane
                .nat()
                .add_mapping(7, "10.0.1.9", Protocol::Tcp, 2222, 22, "ssh")
                .unwrap();
            plane
                .proxy()
                .add_route(7, "svc.example.com", "10.0.1.9", 8000, false, None, None)
                .unwrap();
        }

        let plane = ControlPlane::from_config(&config).unwrap();
        assert_eq!(plane.nat().active_count().unwrap(), 1);

        let report = plane.reconcile().unwrap();
        assert_eq!(report.firewall, SyncReport { applied: 1, failed: 0 });
        assert_eq!(report.proxy, ConfigSyncReport { written: 1, removed: 0 });
        assert_eq!(plane.reconcile().unwrap(), report);
    }
}
