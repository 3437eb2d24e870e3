//! Reverse-proxy engine collaborator
//!
//! Applying proxy configuration is two-phase: `validate` the whole
//! configuration set, then `reload` only if validation passed.

use crate::config::ProxyConfig;
use crate::error::{NetplaneError, Result};
use crate::exec::{args, CommandRunner};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, info};

pub trait ProxyEngine: Send + Sync {
    /// Check the full configuration set; `InvalidProxyConfig` on rejection
    fn validate(&self) -> Result<()>;
    /// Load the validated configuration; `ProxyApply` on failure
    fn reload(&self) -> Result<()>;
}

/// Filesystem locations of generated per-domain documents
#[derive(Debug, Clone)]
pub struct ProxyLayout {
    pub available_dir: PathBuf,
    pub enabled_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl ProxyLayout {
    pub fn document(&self, domain: &str) -> PathBuf {
        self.available_dir.join(format!("{}.conf", domain))
    }

    pub fn link(&self, domain: &str) -> PathBuf {
        self.enabled_dir.join(format!("{}.conf", domain))
    }
}

impl From<&ProxyConfig> for ProxyLayout {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            available_dir: config.available_dir.clone(),
            enabled_dir: config.enabled_dir.clone(),
            log_dir: config.log_dir.clone(),
        }
    }
}

/// nginx driven through its command line
pub struct NginxEngine {
    runner: CommandRunner,
    binary: String,
}

impl NginxEngine {
    pub fn new(runner: CommandRunner, binary: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            binary: binary.into().to_string_lossy().into_owned(),
        }
    }
}

impl ProxyEngine for NginxEngine {
    fn validate(&self) -> Result<()> {
        let output = self.runner.output(&self.binary, &args(["-t"]))?;
        if !output.success {
            return Err(NetplaneError::InvalidProxyConfig(output.stderr.trim().to_string()));
        }
        debug!("nginx configuration test passed");
        Ok(())
    }

    fn reload(&self) -> Result<()> {
        self.runner
            .run(&self.binary, &args(["-s", "reload"]))
            .map_err(|e| NetplaneError::ProxyApply(format!("nginx reload: {}", e)))?;
        info!("Reloaded nginx");
        Ok(())
    }
}

/// Engine double that accepts everything unless told otherwise
#[derive(Default)]
pub struct MemoryProxyEngine {
    reject_config: AtomicBool,
    fail_reload: AtomicBool,
    validations: AtomicUsize,
    reloads: AtomicUsize,
}

impl MemoryProxyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_config(&self, reject: bool) {
        self.reject_config.store(reject, Ordering::SeqCst);
    }

    pub fn fail_reload(&self, fail: bool) {
        self.fail_reload.store(fail, Ordering::SeqCst);
    }

    pub fn validations(&self) -> usize {
        self.validations.load(Ordering::SeqCst)
    }

    /// Successful reloads
    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

impl ProxyEngine for MemoryProxyEngine {
    fn validate(&self) -> Result<()> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        if self.reject_config.load(Ordering::SeqCst) {
            return Err(NetplaneError::InvalidProxyConfig("configuration rejected".to_string()));
        }
        Ok(())
    }

    fn reload(&self) -> Result<()> {
        if self.fail_reload.load(Ordering::SeqCst) {
            return Err(NetplaneError::ProxyApply("reload rejected".to_string()));
        }
        self.reloads.fetch_add(1, Ordering::SeqCst);
        info!("[dry-run] proxy reload");
        Ok(())
    }
}
