//! Persistent record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::NetplaneError;

/// Tenant/container identifier that records and quotas are keyed by
pub type OwnerId = u64;

/// A row kept in a store table
pub trait Record: Clone + Serialize + serde::de::DeserializeOwned + Send + Sync + 'static {
    /// Table name, also used for snapshot file names
    const TABLE: &'static str;

    /// Row ID (0 until inserted)
    fn id(&self) -> u64;

    /// Assign the row ID on insert
    fn set_id(&mut self, id: u64);
}

/// IP address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Family of a parsed address
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    /// Parse `addr` strictly as this family
    pub fn parse(&self, addr: &str) -> Result<IpAddr, NetplaneError> {
        let parsed = match self {
            AddressFamily::Ipv4 => addr.trim().parse::<std::net::Ipv4Addr>().map(IpAddr::V4),
            AddressFamily::Ipv6 => addr.trim().parse::<std::net::Ipv6Addr>().map(IpAddr::V6),
        };
        parsed.map_err(|_| NetplaneError::InvalidAddress(format!("{} is not a valid {} address", addr, self)))
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressFamily::Ipv4 => write!(f, "ipv4"),
            AddressFamily::Ipv6 => write!(f, "ipv6"),
        }
    }
}

impl FromStr for AddressFamily {
    type Err = NetplaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ipv4" | "v4" | "4" => Ok(AddressFamily::Ipv4),
            "ipv6" | "v6" | "6" => Ok(AddressFamily::Ipv6),
            other => Err(NetplaneError::InvalidInput(format!("unknown address family: {}", other))),
        }
    }
}

/// Allocation status of a pooled address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressStatus {
    Available,
    Used,
    Reserved,
}

impl std::fmt::Display for AddressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressStatus::Available => write!(f, "available"),
            AddressStatus::Used => write!(f, "used"),
            AddressStatus::Reserved => write!(f, "reserved"),
        }
    }
}

/// Pooled IP address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub id: u64,
    pub address: IpAddr,
    pub family: AddressFamily,
    pub status: AddressStatus,
    /// Set only while `status` is `Used`
    pub owner: Option<OwnerId>,
    pub gateway: String,
    pub netmask: String,
    pub created_at: DateTime<Utc>,
}

impl AddressRecord {
    /// New available address
    pub fn available(address: IpAddr, gateway: &str, netmask: &str) -> Self {
        Self {
            id: 0,
            address,
            family: AddressFamily::of(&address),
            status: AddressStatus::Available,
            owner: None,
            gateway: gateway.to_string(),
            netmask: netmask.to_string(),
            created_at: Utc::now(),
        }
    }
}

impl Record for AddressRecord {
    const TABLE: &'static str = "addresses";

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
}

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = NetplaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(NetplaneError::InvalidInput(format!("unknown protocol: {}", other))),
        }
    }
}

/// Whether a mapping or route is enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingStatus {
    Active,
    Inactive,
}

/// NAT port mapping: (external port, protocol) -> (target address, internal port)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub id: u64,
    pub owner: OwnerId,
    pub target_address: IpAddr,
    pub protocol: Protocol,
    pub external_port: u16,
    pub internal_port: u16,
    pub description: String,
    pub status: BindingStatus,
    pub created_at: DateTime<Utc>,
}

impl PortMapping {
    pub fn is_active(&self) -> bool {
        self.status == BindingStatus::Active
    }
}

impl Record for PortMapping {
    const TABLE: &'static str = "port_mappings";

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
}

/// Reverse-proxy route: domain -> target address and port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRoute {
    pub id: u64,
    pub owner: OwnerId,
    pub domain: String,
    pub target_address: IpAddr,
    pub target_port: u16,
    pub tls_enabled: bool,
    pub cert_ref: Option<PathBuf>,
    pub key_ref: Option<PathBuf>,
    pub status: BindingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProxyRoute {
    pub fn is_active(&self) -> bool {
        self.status == BindingStatus::Active
    }
}

impl Record for ProxyRoute {
    const TABLE: &'static str = "proxy_routes";

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
}

/// A resource limit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Limit {
    #[default]
    Unlimited,
    Limited(u64),
}

impl Limit {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Limit::Unlimited)
    }

    /// Whether `used + requested` stays within the limit
    pub fn allows(&self, used: u64, requested: u64) -> bool {
        match self {
            Limit::Unlimited => true,
            Limit::Limited(max) => used.saturating_add(requested) <= *max,
        }
    }
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Limit::Unlimited => write!(f, "unlimited"),
            Limit::Limited(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for Limit {
    type Err = NetplaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("unlimited") {
            return Ok(Limit::Unlimited);
        }
        s.parse::<u64>()
            .map(Limit::Limited)
            .map_err(|_| NetplaneError::InvalidInput(format!("invalid limit: {}", s)))
    }
}

/// Action taken when traffic usage reaches its quota
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OveragePolicy {
    /// Log only
    #[default]
    Warn,
    /// Reject new allocations
    Limit,
    /// Reject new allocations and stop the owner's workload
    Stop,
}

impl std::fmt::Display for OveragePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OveragePolicy::Warn => write!(f, "warn"),
            OveragePolicy::Limit => write!(f, "limit"),
            OveragePolicy::Stop => write!(f, "stop"),
        }
    }
}

impl FromStr for OveragePolicy {
    type Err = NetplaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "warn" => Ok(OveragePolicy::Warn),
            "limit" => Ok(OveragePolicy::Limit),
            "stop" => Ok(OveragePolicy::Stop),
            other => Err(NetplaneError::InvalidInput(format!("unknown overage policy: {}", other))),
        }
    }
}

/// Per-owner resource quota
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub id: u64,
    pub owner: OwnerId,
    pub address_quota: Limit,
    pub port_mapping_quota: Limit,
    pub proxy_quota: Limit,
    /// Bytes per period
    pub traffic_quota: Limit,
    pub traffic_used: u64,
    pub traffic_reset_at: DateTime<Utc>,
    pub overage_policy: OveragePolicy,
}

impl Quota {
    /// All-unlimited quota for a new owner
    pub fn unlimited(owner: OwnerId, traffic_reset_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            owner,
            address_quota: Limit::Unlimited,
            port_mapping_quota: Limit::Unlimited,
            proxy_quota: Limit::Unlimited,
            traffic_quota: Limit::Unlimited,
            traffic_used: 0,
            traffic_reset_at,
            overage_policy: OveragePolicy::Warn,
        }
    }

    /// Traffic used in the period containing `now`
    pub fn traffic_in_period(&self, now: DateTime<Utc>) -> u64 {
        if now > self.traffic_reset_at {
            0
        } else {
            self.traffic_used
        }
    }

    /// Whether the traffic quota is spent at `now`
    pub fn traffic_exhausted(&self, now: DateTime<Utc>) -> bool {
        match self.traffic_quota {
            Limit::Unlimited => false,
            Limit::Limited(max) => self.traffic_in_period(now) >= max,
        }
    }
}

impl Record for Quota {
    const TABLE: &'static str = "quotas";

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_family_parse_is_strict() {
        assert!(AddressFamily::Ipv4.parse("10.0.0.1").is_ok());
        assert!(AddressFamily::Ipv4.parse("2001:db8::1").is_err());
        assert!(AddressFamily::Ipv6.parse("10.0.0.1").is_err());
        assert!(AddressFamily::Ipv6.parse("2001:db8::1").is_ok());
        assert_eq!("IPv6".parse::<AddressFamily>().unwrap(), AddressFamily::Ipv6);
    }

    #[test]
    fn test_limit_allows() {
        assert!(Limit::Unlimited.allows(u64::MAX, 1));
        assert!(Limit::Limited(2).allows(1, 1));
        assert!(!Limit::Limited(1).allows(1, 1));
        assert!(!Limit::Limited(0).allows(0, 1));
        assert_eq!("unlimited".parse::<Limit>().unwrap(), Limit::Unlimited);
        assert_eq!("5".parse::<Limit>().unwrap(), Limit::Limited(5));
        assert!("-1".parse::<Limit>().is_err());
    }

    #[test]
    fn test_limit_serde() {
        assert_eq!(serde_json::to_string(&Limit::Unlimited).unwrap(), "\"unlimited\"");
        assert_eq!(serde_json::to_string(&Limit::Limited(3)).unwrap(), "{\"limited\":3}");
        let back: Limit = serde_json::from_str("{\"limited\":3}").unwrap();
        assert_eq!(back, Limit::Limited(3));
    }

    #[test]
    fn test_traffic_period() {
        let now = Utc::now();
        let mut quota = Quota::unlimited(1, now - Duration::days(1));
        quota.traffic_used = 500;
        quota.traffic_quota = Limit::Limited(100);
        assert_eq!(quota.traffic_in_period(now), 0);
        assert!(!quota.traffic_exhausted(now));

        quota.traffic_reset_at = now + Duration::days(1);
        assert!(quota.traffic_exhausted(now));
    }
}
