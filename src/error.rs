//! Error types for netplane

use crate::store::records::{AddressFamily, Protocol};
use thiserror::Error;

/// Result type for netplane operations
pub type Result<T> = std::result::Result<T, NetplaneError>;

/// Resource families gated by the quota manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Address,
    PortMapping,
    Proxy,
    Traffic,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Address => write!(f, "address"),
            Resource::PortMapping => write!(f, "port mapping"),
            Resource::Proxy => write!(f, "proxy"),
            Resource::Traffic => write!(f, "traffic"),
        }
    }
}

/// Coarse error classes surfaced to the API layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    Conflict,
    Exhausted,
    QuotaExceeded,
    ExternalApplyFailed,
    NotFound,
    Internal,
}

/// Netplane error types
#[derive(Error, Debug)]
pub enum NetplaneError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Address range too large: {requested} addresses (maximum {max})")]
    RangeTooLarge { requested: u128, max: u64 },

    #[error("Address already in pool: {0}")]
    AddressInUse(String),

    #[error("External port {port}/{protocol} already in use")]
    PortInUse { port: u16, protocol: Protocol },

    #[error("Domain already in use: {0}")]
    DomainInUse(String),

    #[error("No {0} address available")]
    PoolExhausted(AddressFamily),

    #[error("No free {protocol} port found after {attempts} attempts")]
    PortExhausted { protocol: Protocol, attempts: u32 },

    #[error("{resource} quota exceeded (current: {current}, requested: {requested}, limit: {limit})")]
    QuotaExceeded {
        resource: Resource,
        current: u64,
        requested: u64,
        limit: u64,
    },

    #[error("Firewall error: {0}")]
    FirewallApply(String),

    #[error("Proxy engine error: {0}")]
    ProxyApply(String),

    #[error("Invalid proxy configuration: {0}")]
    InvalidProxyConfig(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Container lifecycle error: {0}")]
    Lifecycle(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl NetplaneError {
    /// Build a not-found error for a record kind
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        NetplaneError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Classify the error for callers that render it
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetplaneError::InvalidAddress(_)
            | NetplaneError::InvalidDomain(_)
            | NetplaneError::InvalidPort(_)
            | NetplaneError::InvalidInput(_)
            | NetplaneError::RangeTooLarge { .. } => ErrorKind::InvalidInput,
            NetplaneError::AddressInUse(_)
            | NetplaneError::PortInUse { .. }
            | NetplaneError::DomainInUse(_) => ErrorKind::Conflict,
            NetplaneError::PoolExhausted(_) | NetplaneError::PortExhausted { .. } => {
                ErrorKind::Exhausted
            }
            NetplaneError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            NetplaneError::FirewallApply(_)
            | NetplaneError::ProxyApply(_)
            | NetplaneError::InvalidProxyConfig(_)
            | NetplaneError::Command(_)
            | NetplaneError::Timeout(_)
            | NetplaneError::Lifecycle(_) => ErrorKind::ExternalApplyFailed,
            NetplaneError::NotFound { .. } => ErrorKind::NotFound,
            NetplaneError::Store(_)
            | NetplaneError::Lock(_)
            | NetplaneError::Config(_)
            | NetplaneError::Io(_)
            | NetplaneError::Json(_)
            | NetplaneError::Yaml(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_error_message() {
        let err = NetplaneError::QuotaExceeded {
            resource: Resource::PortMapping,
            current: 1,
            requested: 1,
            limit: 1,
        };
        assert_eq!(
            err.to_string(),
            "port mapping quota exceeded (current: 1, requested: 1, limit: 1)"
        );
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    }

    #[test]
    fn test_error_kinds() {
        let conflict = NetplaneError::PortInUse {
            port: 8080,
            protocol: Protocol::Tcp,
        };
        assert_eq!(conflict.kind(), ErrorKind::Conflict);
        assert_eq!(conflict.to_string(), "External port 8080/tcp already in use");

        assert_eq!(
            NetplaneError::PoolExhausted(AddressFamily::Ipv6).kind(),
            ErrorKind::Exhausted
        );
        assert_eq!(
            NetplaneError::not_found("port mapping", 7).to_string(),
            "port mapping not found: 7"
        );
    }
}
