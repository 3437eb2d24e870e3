//! Netplane - network resource control plane for container hosts
//!
//! Netplane hands out per-tenant network resources and keeps the host's
//! enforcement state in line with them:
//!
//! - IPv4/IPv6 address pools
//! - NAT port mappings backed by iptables rules
//! - nginx reverse-proxy routes per domain
//! - Per-owner quotas with traffic accounting and overage policies
//!
//! All records live in a [`store::Store`]; firewall and proxy state is
//! rebuilt from it by [`plane::ControlPlane::reconcile`].

pub mod config;
pub mod error;
pub mod exec;
pub mod network;
pub mod plane;
pub mod quota;
pub mod store;

pub use error::{NetplaneError, Result};
pub use plane::ControlPlane;
