//! Control-plane configuration
//!
//! Loaded from YAML. Every section has defaults so an empty file (or no
//! file at all) yields a working configuration.

use crate::error::{NetplaneError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetplaneConfig {
    /// Directory holding the store snapshots
    pub state_dir: PathBuf,
    /// Use in-memory firewall, proxy engine and lifecycle adapters
    pub dry_run: bool,
    /// Deadline for every external command, in seconds
    pub command_timeout_secs: u64,
    pub pool: PoolConfig,
    pub nat: NatConfig,
    pub firewall: FirewallConfig,
    pub proxy: ProxyConfig,
    pub lifecycle: LifecycleConfig,
}

impl Default for NetplaneConfig {
    fn default() -> Self {
        Self {
            state_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/var/lib"))
                .join("netplane"),
            dry_run: false,
            command_timeout_secs: 30,
            pool: PoolConfig::default(),
            nat: NatConfig::default(),
            firewall: FirewallConfig::default(),
            proxy: ProxyConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

/// Address pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Largest number of addresses a single range insertion may create
    pub max_range_size: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_range_size: 65_536,
        }
    }
}

/// NAT port-mapping settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    /// First port of the ephemeral range used for random mappings
    pub ephemeral_start: u16,
    /// Last port (inclusive) of the ephemeral range
    pub ephemeral_end: u16,
    /// Attempts before a random allocation gives up
    pub random_attempts: u32,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            ephemeral_start: 10_000,
            ephemeral_end: 65_535,
            random_attempts: 100,
        }
    }
}

/// iptables adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub iptables: String,
    pub ip6tables: String,
    /// Comment prefix attached to every rule this process owns
    pub rule_tag: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            iptables: "iptables".to_string(),
            ip6tables: "ip6tables".to_string(),
            rule_tag: "netplane".to_string(),
        }
    }
}

/// nginx adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub nginx_bin: PathBuf,
    /// Where generated per-domain documents are written
    pub available_dir: PathBuf,
    /// Where enabled documents are linked
    pub enabled_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            nginx_bin: PathBuf::from("/usr/sbin/nginx"),
            available_dir: PathBuf::from("/etc/nginx/sites-available"),
            enabled_dir: PathBuf::from("/etc/nginx/sites-enabled"),
            log_dir: PathBuf::from("/var/log/nginx"),
        }
    }
}

/// Container lifecycle collaborator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Stop command; `{owner}` is replaced with the owner ID
    pub stop_command: Vec<String>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stop_command: vec!["lxc".to_string(), "stop".to_string(), "{owner}".to_string()],
        }
    }
}

impl NetplaneConfig {
    /// Parse a configuration from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: NetplaneConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&data)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Candidate configuration files, highest priority first
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("./netplane.yaml")];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("netplane").join("config.yaml"));
        }
        paths.push(PathBuf::from("/etc/netplane/config.yaml"));
        paths
    }

    /// Load the first configuration file found, or the defaults
    pub fn discover() -> Result<Self> {
        for path in Self::search_paths() {
            if path.is_file() {
                return Self::load(&path);
            }
        }

        info!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Command deadline as a duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.nat.ephemeral_start == 0 || self.nat.ephemeral_start > self.nat.ephemeral_end {
            return Err(NetplaneError::Config(format!(
                "invalid ephemeral range {}-{}",
                self.nat.ephemeral_start, self.nat.ephemeral_end
            )));
        }
        if self.nat.random_attempts == 0 {
            return Err(NetplaneError::Config("nat.random_attempts must be positive".to_string()));
        }
        if self.pool.max_range_size == 0 {
            return Err(NetplaneError::Config("pool.max_range_size must be positive".to_string()));
        }
        if self.command_timeout_secs == 0 {
            return Err(NetplaneError::Config("command_timeout_secs must be positive".to_string()));
        }
        if self.firewall.rule_tag.trim().is_empty()
            || self.firewall.rule_tag.contains(char::is_whitespace)
        {
            return Err(NetplaneError::Config(
                "firewall.rule_tag must be a single non-empty word".to_string(),
            ));
        }
        if self.lifecycle.stop_command.is_empty() {
            return Err(NetplaneError::Config("lifecycle.stop_command must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = NetplaneConfig::default();
        assert_eq!(config.nat.ephemeral_start, 10_000);
        assert_eq!(config.nat.ephemeral_end, 65_535);
        assert_eq!(config.nat.random_attempts, 100);
        assert_eq!(config.pool.max_range_size, 65_536);
        assert_eq!(config.firewall.rule_tag, "netplane");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = NetplaneConfig::from_yaml(
            "dry_run: true\nnat:\n  ephemeral_start: 20000\nproxy:\n  enabled_dir: /tmp/enabled\n",
        )
        .unwrap();

        assert!(config.dry_run);
        assert_eq!(config.nat.ephemeral_start, 20_000);
        assert_eq!(config.nat.ephemeral_end, 65_535);
        assert_eq!(config.proxy.enabled_dir, PathBuf::from("/tmp/enabled"));
        assert_eq!(config.proxy.available_dir, PathBuf::from("/etc/nginx/sites-available"));
    }

    #[test]
    fn test_rejects_inverted_ephemeral_range() {
        let err = NetplaneConfig::from_yaml("nat:\n  ephemeral_start: 30000\n  ephemeral_end: 20000\n")
            .unwrap_err();
        assert!(matches!(err, NetplaneError::Config(_)));
    }

    #[test]
    fn test_load_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("netplane.yaml");
        std::fs::write(&path, "command_timeout_secs: 5\npool:\n  max_range_size: 256\n").unwrap();

        let config = NetplaneConfig::load(&path).unwrap();
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.pool.max_range_size, 256);
    }
}
