//! Reverse-proxy route manager
//!
//! Each active route owns one generated nginx server block in the layout's
//! `available_dir`, enabled through a symlink in `enabled_dir`. Documents
//! are only kept when the engine validated and reloaded them.

use super::engine::{ProxyEngine, ProxyLayout};
use crate::error::{NetplaneError, Resource, Result};
use crate::quota::QuotaManager;
use crate::store::{BindingStatus, OwnerId, ProxyRoute, Store};
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// First line of every generated document
pub const MANAGED_MARKER: &str = "# managed by netplane";

const DOMAIN_LABEL: &str = r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$";

/// Check that `domain` is a plain DNS name usable as a file name
pub fn validate_domain(domain: &str) -> Result<()> {
    if domain.is_empty() || domain.len() > 253 {
        return Err(NetplaneError::InvalidDomain(format!(
            "'{}' must be 1-253 characters",
            domain
        )));
    }

    let label = Regex::new(DOMAIN_LABEL).map_err(|e| NetplaneError::InvalidInput(e.to_string()))?;
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return Err(NetplaneError::InvalidDomain(format!(
            "'{}' needs at least two labels",
            domain
        )));
    }
    if let Some(bad) = labels.iter().find(|l| !label.is_match(&l.to_ascii_lowercase())) {
        return Err(NetplaneError::InvalidDomain(format!(
            "'{}' has invalid label '{}'",
            domain, bad
        )));
    }

    Ok(())
}

/// Render the nginx server block for a route
pub fn render_server_block(route: &ProxyRoute, log_dir: &Path) -> String {
    let upstream = match route.target_address {
        IpAddr::V4(v4) => format!("{}:{}", v4, route.target_port),
        IpAddr::V6(v6) => format!("[{}]:{}", v6, route.target_port),
    };

    let mut doc = format!("{}: {}\n", MANAGED_MARKER, route.domain);
    doc.push_str("server {\n");
    doc.push_str("    listen 80;\n");
    doc.push_str(&format!("    server_name {};\n", route.domain));

    if route.tls_enabled {
        if let (Some(cert), Some(key)) = (&route.cert_ref, &route.key_ref) {
            doc.push_str("\n    listen 443 ssl http2;\n");
            doc.push_str(&format!("    ssl_certificate {};\n", cert.display()));
            doc.push_str(&format!("    ssl_certificate_key {};\n", key.display()));
            doc.push_str("    ssl_protocols TLSv1.2 TLSv1.3;\n");
            doc.push_str("    ssl_ciphers HIGH:!aNULL:!MD5;\n");
        }
    }

    doc.push_str("\n    location / {\n");
    doc.push_str(&format!("        proxy_pass http://{};\n", upstream));
    doc.push_str("        proxy_set_header Host $host;\n");
    doc.push_str("        proxy_set_header X-Real-IP $remote_addr;\n");
    doc.push_str("        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
    doc.push_str("        proxy_set_header X-Forwarded-Proto $scheme;\n");
    doc.push('\n');
    doc.push_str("        proxy_http_version 1.1;\n");
    doc.push_str("        proxy_set_header Upgrade $http_upgrade;\n");
    doc.push_str("        proxy_set_header Connection \"upgrade\";\n");
    doc.push('\n');
    doc.push_str("        proxy_connect_timeout 60s;\n");
    doc.push_str("        proxy_send_timeout 60s;\n");
    doc.push_str("        proxy_read_timeout 60s;\n");
    doc.push_str("    }\n\n");
    doc.push_str(&format!(
        "    access_log {};\n",
        log_dir.join(format!("{}_access.log", route.domain)).display()
    ));
    doc.push_str(&format!(
        "    error_log {};\n",
        log_dir.join(format!("{}_error.log", route.domain)).display()
    ));
    doc.push_str("}\n");
    doc
}

/// Result of rebuilding the proxy configuration from the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSyncReport {
    pub written: usize,
    pub removed: usize,
}

/// Domain routing manager
pub struct ProxyManager {
    store: Arc<dyn Store>,
    quotas: Arc<QuotaManager>,
    engine: Arc<dyn ProxyEngine>,
    layout: ProxyLayout,
    lock: Mutex<()>,
}

impl ProxyManager {
    pub fn new(
        store: Arc<dyn Store>,
        quotas: Arc<QuotaManager>,
        engine: Arc<dyn ProxyEngine>,
        layout: ProxyLayout,
    ) -> Self {
        Self {
            store,
            quotas,
            engine,
            layout,
            lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| NetplaneError::Lock("Failed to acquire proxy lock".to_string()))
    }

    /// Route a domain to `target:port`
    #[allow(clippy::too_many_arguments)]
    pub fn add_route(
        &self,
        owner: OwnerId,
        domain: &str,
        target: &str,
        target_port: u16,
        tls: bool,
        cert: Option<&Path>,
        key: Option<&Path>,
    ) -> Result<ProxyRoute> {
        let domain = domain.trim().to_ascii_lowercase();
        validate_domain(&domain)?;
        let target_address: IpAddr = target
            .trim()
            .parse()
            .map_err(|_| NetplaneError::InvalidAddress(target.to_string()))?;
        if target_port == 0 {
            return Err(NetplaneError::InvalidPort("0".to_string()));
        }
        let (cert_ref, key_ref) = tls_material(tls, cert, key)?;

        self.quotas.check_proxy_quota(owner, 1)?;

        let _guard = self.lock()?;
        let taken = self
            .store
            .proxy_routes()
            .count(&|r| r.is_active() && r.domain == domain)?;
        if taken > 0 {
            return Err(NetplaneError::DomainInUse(domain));
        }
        self.check_unmanaged(&domain)?;

        let now = Utc::now();
        let route = ProxyRoute {
            id: 0,
            owner,
            domain,
            target_address,
            target_port,
            tls_enabled: tls,
            cert_ref,
            key_ref,
            status: BindingStatus::Active,
            created_at: now,
            updated_at: now,
        };

        self.install(&route, None)?;

        match self.store.proxy_routes().insert(route.clone()) {
            Ok(route) => {
                info!(
                    "Routed {} to {}:{} for owner {}",
                    route.domain, route.target_address, route.target_port, owner
                );
                Ok(route)
            }
            Err(e) => {
                self.uninstall(&route.domain);
                if let Err(reload) = self.engine.reload() {
                    warn!("Failed to reload proxy after rollback of {}: {}", route.domain, reload);
                }
                Err(e)
            }
        }
    }

    /// Replace the TLS material of a route
    pub fn update_tls(&self, route_id: u64, cert: &Path, key: &Path) -> Result<ProxyRoute> {
        let _guard = self.lock()?;
        let mut route = self.get(route_id)?;
        route.tls_enabled = true;
        route.cert_ref = Some(cert.to_path_buf());
        route.key_ref = Some(key.to_path_buf());
        route.updated_at = Utc::now();

        let previous = match fs::read_to_string(self.layout.document(&route.domain)) {
            Ok(doc) => Some(doc),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        self.install(&route, previous.as_deref())?;

        self.store.proxy_routes().update(&route)?;
        info!("Updated TLS material of {}", route.domain);
        Ok(route)
    }

    /// Remove a route and its configuration
    pub fn remove_route(&self, route_id: u64) -> Result<ProxyRoute> {
        let route = {
            let _guard = self.lock()?;
            let route = self.get(route_id)?;

            self.uninstall(&route.domain);
            if let Err(e) = self.engine.reload() {
                warn!("Proxy reload after removing {} failed: {}", route.domain, e);
            }
            self.store.proxy_routes().delete(route.id)?;
            route
        };

        self.quotas.released(route.owner, Resource::Proxy, 1);
        info!("Removed route {} of owner {}", route.domain, route.owner);
        Ok(route)
    }

    /// Remove every route of an owner with a single reload
    pub fn remove_owner_routes(&self, owner: OwnerId) -> Result<usize> {
        let removed = {
            let _guard = self.lock()?;
            let routes = self.store.proxy_routes().find(&|r| r.owner == owner)?;
            if routes.is_empty() {
                return Ok(0);
            }

            for route in &routes {
                self.uninstall(&route.domain);
            }
            if let Err(e) = self.engine.reload() {
                warn!("Proxy reload after removing routes of owner {} failed: {}", owner, e);
            }
            self.store.proxy_routes().delete_where(&|r| r.owner == owner)?
        };

        self.quotas.released(owner, Resource::Proxy, removed);
        Ok(removed)
    }

    /// Rewrite every active route's document and drop stale managed ones
    pub fn sync_configs(&self) -> Result<ConfigSyncReport> {
        let _guard = self.lock()?;
        let routes = self.store.proxy_routes().find(&|r| r.is_active())?;
        let mut report = ConfigSyncReport::default();

        let mut wanted = HashSet::new();
        for route in &routes {
            self.write_document(route)?;
            self.enable(&route.domain)?;
            wanted.insert(format!("{}.conf", route.domain));
            report.written += 1;
        }

        for stale in self.managed_documents()? {
            let name = stale
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if wanted.contains(&name) {
                continue;
            }
            if let Some(domain) = name.strip_suffix(".conf") {
                debug!("Removing stale proxy document {}", stale.display());
                self.uninstall(domain);
                report.removed += 1;
            }
        }

        self.engine.validate()?;
        self.engine.reload()?;

        info!(
            "Synced proxy: {} documents written, {} stale removed",
            report.written, report.removed
        );
        Ok(report)
    }

    pub fn get(&self, route_id: u64) -> Result<ProxyRoute> {
        self.store
            .proxy_routes()
            .get(route_id)?
            .ok_or_else(|| NetplaneError::not_found("proxy route", route_id))
    }

    pub fn routes_for(&self, owner: OwnerId) -> Result<Vec<ProxyRoute>> {
        self.store.proxy_routes().find(&|r| r.owner == owner)
    }

    pub fn list(&self) -> Result<Vec<ProxyRoute>> {
        self.store.proxy_routes().find(&|_| true)
    }

    pub fn active_count(&self) -> Result<usize> {
        self.store.proxy_routes().count(&|r| r.is_active())
    }

    /// Write, enable, validate and reload; on failure put back `previous`
    /// (or remove the document when there was none)
    fn install(&self, route: &ProxyRoute, previous: Option<&str>) -> Result<()> {
        self.write_document(route)?;
        self.enable(&route.domain)?;

        let applied = self.engine.validate().and_then(|_| self.engine.reload());
        if let Err(e) = applied {
            match previous {
                Some(doc) => {
                    if let Err(restore) = write_atomic(&self.layout.document(&route.domain), doc) {
                        warn!("Failed to restore proxy document of {}: {}", route.domain, restore);
                    }
                }
                None => self.uninstall(&route.domain),
            }
            return Err(e);
        }

        Ok(())
    }

    fn write_document(&self, route: &ProxyRoute) -> Result<()> {
        let doc = render_server_block(route, &self.layout.log_dir);
        write_atomic(&self.layout.document(&route.domain), &doc)
    }

    fn enable(&self, domain: &str) -> Result<()> {
        let link = self.layout.link(domain);
        fs::create_dir_all(&self.layout.enabled_dir)?;
        if fs::symlink_metadata(&link).is_ok() {
            fs::remove_file(&link)?;
        }
        std::os::unix::fs::symlink(self.layout.document(domain), &link)?;
        Ok(())
    }

    /// Remove link and document, logging anything but absence
    fn uninstall(&self, domain: &str) {
        for path in [self.layout.link(domain), self.layout.document(domain)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }

    /// Documents in `available_dir` that start with the managed marker
    /// Refuse to take over a document someone else wrote for the domain
    fn check_unmanaged(&self, domain: &str) -> Result<()> {
        match fs::read_to_string(self.layout.document(domain)) {
            Ok(doc) if !doc.starts_with(MANAGED_MARKER) => Err(NetplaneError::DomainInUse(format!(
                "{} (unmanaged configuration exists)",
                domain
            ))),
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn managed_documents(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.layout.available_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut managed = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().map(|e| e == "conf").unwrap_or(false)
                && fs::read_to_string(&path)
                    .map(|doc| doc.starts_with(MANAGED_MARKER))
                    .unwrap_or(false)
            {
                managed.push(path);
            }
        }
        managed.sort();
        Ok(managed)
    }
}

fn tls_material(
    tls: bool,
    cert: Option<&Path>,
    key: Option<&Path>,
) -> Result<(Option<PathBuf>, Option<PathBuf>)> {
    if !tls {
        return Ok((None, None));
    }
    match (cert, key) {
        (Some(cert), Some(key)) => Ok((Some(cert.to_path_buf()), Some(key.to_path_buf()))),
        _ => Err(NetplaneError::InvalidInput(
            "TLS routes need both a certificate and a key".to_string(),
        )),
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("conf.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
