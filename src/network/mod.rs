//! Network management module
//!
//! Address pool, NAT port mappings and reverse-proxy routes, each behind
//! its own manager, plus the external collaborators they drive.

pub mod engine;
pub mod firewall;
pub mod nat;
pub mod pool;
pub mod proxy;

pub use engine::{MemoryProxyEngine, NginxEngine, ProxyEngine, ProxyLayout};
pub use firewall::{FirewallApplier, ForwardRule, IptablesFirewall, MemoryFirewall};
pub use nat::{parse_port_range, NatManager, RangeOutcome, SyncReport};
pub use pool::{next_address, range_size, AddressPool};
pub use proxy::{render_server_block, validate_domain, ConfigSyncReport, ProxyManager};
