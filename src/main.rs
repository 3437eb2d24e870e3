//! Netplane - network resource control plane
//!
//! Operator CLI around the library: inspect state, manage the address pool
//! and quotas, and reconcile firewall/proxy state after a restart.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use netplane::config::NetplaneConfig;
use netplane::quota::QuotaUpdate;
use netplane::store::{AddressFamily, Limit, OveragePolicy, OwnerId};
use netplane::ControlPlane;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Netplane - address, port and proxy allocation for container hosts
#[derive(Parser)]
#[command(name = "netplane")]
#[command(version)]
#[command(about = "Network resource control plane for container hosts", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Configuration file (default: search the standard locations)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Simulate firewall, proxy engine and workload lifecycle
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild firewall rules and proxy configuration from the store
    Reconcile,

    /// Release every resource an owner holds
    ReleaseOwner {
        owner: OwnerId,
    },

    /// Manage the address pool
    Pool {
        #[command(subcommand)]
        command: PoolCommands,
    },

    /// Inspect and manage port mappings
    Nat {
        #[command(subcommand)]
        command: NatCommands,
    },

    /// Inspect and manage proxy routes
    Proxy {
        #[command(subcommand)]
        command: ProxyCommands,
    },

    /// Manage quotas
    Quota {
        #[command(subcommand)]
        command: QuotaCommands,
    },
}

#[derive(Subcommand)]
enum PoolCommands {
    /// Add an inclusive address range
    AddRange {
        start: String,
        end: String,
        #[arg(short, long, default_value = "")]
        gateway: String,
        #[arg(short, long, default_value = "")]
        netmask: String,
        #[arg(short, long, default_value = "ipv4")]
        family: AddressFamily,
    },
    /// Remove the available addresses of a range
    RemoveRange {
        start: String,
        end: String,
    },
    /// Count available addresses
    Available {
        #[arg(short, long, default_value = "ipv4")]
        family: AddressFamily,
    },
    /// List pooled addresses
    #[command(name = "ls")]
    List,
}

#[derive(Subcommand)]
enum NatCommands {
    /// List port mappings
    #[command(name = "ls")]
    List {
        /// Only this owner's mappings
        #[arg(short, long)]
        owner: Option<OwnerId>,
    },
    /// Remove a port mapping
    #[command(name = "rm")]
    Remove {
        id: u64,
    },
    /// Re-apply every active mapping to the firewall
    Sync,
}

#[derive(Subcommand)]
enum ProxyCommands {
    /// List proxy routes
    #[command(name = "ls")]
    List {
        /// Only this owner's routes
        #[arg(short, long)]
        owner: Option<OwnerId>,
    },
    /// Remove a proxy route
    #[command(name = "rm")]
    Remove {
        id: u64,
    },
    /// Rewrite every active route's configuration
    Sync,
}

#[derive(Subcommand)]
enum QuotaCommands {
    /// Show an owner's quota
    Show {
        owner: OwnerId,
    },
    /// Change an owner's limits ("unlimited" or a number)
    Set {
        owner: OwnerId,
        #[arg(long)]
        addresses: Option<Limit>,
        #[arg(long)]
        port_mappings: Option<Limit>,
        #[arg(long)]
        proxies: Option<Limit>,
        /// Traffic limit in bytes
        #[arg(long)]
        traffic: Option<Limit>,
        #[arg(long)]
        policy: Option<OveragePolicy>,
    },
    /// Zero an owner's traffic counter
    Reset {
        owner: OwnerId,
    },
    /// Show live usage next to the limits
    Usage {
        owner: OwnerId,
    },
    /// Totals across all owners
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &cli.config {
        Some(path) => NetplaneConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => NetplaneConfig::discover().context("loading configuration")?,
    };
    if cli.dry_run {
        config.dry_run = true;
    }

    let plane = ControlPlane::from_config(&config).context("initializing control plane")?;

    match cli.command {
        Commands::Reconcile => {
            let report = plane.reconcile()?;
            println!(
                "firewall: {} applied, {} failed; proxy: {} written, {} removed",
                report.firewall.applied,
                report.firewall.failed,
                report.proxy.written,
                report.proxy.removed
            );
        }

        Commands::ReleaseOwner { owner } => {
            let release = plane.release_owner(owner);
            println!(
                "released {} mappings, {} routes, {} addresses ({} errors)",
                release.port_mappings, release.proxy_routes, release.addresses, release.errors
            );
        }

        Commands::Pool { command } => match command {
            PoolCommands::AddRange {
                start,
                end,
                gateway,
                netmask,
                family,
            } => {
                let added = plane
                    .pool()
                    .add_range(&start, &end, &gateway, &netmask, family)?;
                println!("added {} addresses", added.len());
            }
            PoolCommands::RemoveRange { start, end } => {
                let removed = plane.pool().remove_range(&start, &end)?;
                println!("removed {} addresses", removed);
            }
            PoolCommands::Available { family } => {
                println!("{}", plane.pool().count_available(family)?);
            }
            PoolCommands::List => {
                println!(
                    "{:<6} {:<40} {:<10} {:<8} {:<16}",
                    "ID", "ADDRESS", "STATUS", "OWNER", "GATEWAY"
                );
                for record in plane.pool().list()? {
                    println!(
                        "{:<6} {:<40} {:<10} {:<8} {:<16}",
                        record.id,
                        record.address.to_string(),
                        format!("{:?}", record.status).to_lowercase(),
                        record.owner.map(|o| o.to_string()).unwrap_or_else(|| "-".to_string()),
                        record.gateway
                    );
                }
            }
        },

        Commands::Nat { command } => match command {
            NatCommands::List { owner } => {
                let mappings = match owner {
                    Some(owner) => plane.nat().mappings_for(owner)?,
                    None => plane.nat().list()?,
                };
                println!(
                    "{:<6} {:<8} {:<12} {:<40} {:<20}",
                    "ID", "OWNER", "EXTERNAL", "TARGET", "CREATED"
                );
                for m in mappings {
                    println!(
                        "{:<6} {:<8} {:<12} {:<40} {:<20}",
                        m.id,
                        m.owner,
                        format!("{}/{}", m.external_port, m.protocol),
                        format!("{}:{}", m.target_address, m.internal_port),
                        m.created_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
            NatCommands::Remove { id } => {
                let mapping = plane.nat().remove_mapping(id)?;
                println!("{}", mapping.id);
            }
            NatCommands::Sync => {
                let report = plane.nat().sync_rules()?;
                println!("{} applied, {} failed", report.applied, report.failed);
            }
        },

        Commands::Proxy { command } => match command {
            ProxyCommands::List { owner } => {
                let routes = match owner {
                    Some(owner) => plane.proxy().routes_for(owner)?,
                    None => plane.proxy().list()?,
                };
                println!(
                    "{:<6} {:<8} {:<32} {:<40} {:<5}",
                    "ID", "OWNER", "DOMAIN", "TARGET", "TLS"
                );
                for r in routes {
                    println!(
                        "{:<6} {:<8} {:<32} {:<40} {:<5}",
                        r.id,
                        r.owner,
                        r.domain,
                        format!("{}:{}", r.target_address, r.target_port),
                        if r.tls_enabled { "yes" } else { "no" }
                    );
                }
            }
            ProxyCommands::Remove { id } => {
                let route = plane.proxy().remove_route(id)?;
                println!("{}", route.domain);
            }
            ProxyCommands::Sync => {
                let report = plane.proxy().sync_configs()?;
                println!("{} written, {} removed", report.written, report.removed);
            }
        },

        Commands::Quota { command } => match command {
            QuotaCommands::Show { owner } => {
                let quota = plane.quotas().get_or_create(owner)?;
                println!("{}", serde_json::to_string_pretty(&quota)?);
            }
            QuotaCommands::Set {
                owner,
                addresses,
                port_mappings,
                proxies,
                traffic,
                policy,
            } => {
                let quota = plane.quotas().update(
                    owner,
                    QuotaUpdate {
                        address_quota: addresses,
                        port_mapping_quota: port_mappings,
                        proxy_quota: proxies,
                        traffic_quota: traffic,
                        overage_policy: policy,
                    },
                )?;
                println!("{}", serde_json::to_string_pretty(&quota)?);
            }
            QuotaCommands::Reset { owner } => {
                let quota = plane.quotas().reset_traffic(owner)?;
                println!("traffic reset, next period starts {}", quota.traffic_reset_at);
            }
            QuotaCommands::Usage { owner } => {
                let usage = plane.quotas().usage(owner)?;
                println!("addresses:     {} / {}", usage.addresses_used, usage.quota.address_quota);
                println!(
                    "port mappings: {} / {}",
                    usage.port_mappings_used, usage.quota.port_mapping_quota
                );
                println!("proxies:       {} / {}", usage.proxies_used, usage.quota.proxy_quota);
                println!("traffic:       {} / {}", usage.traffic_used, usage.quota.traffic_quota);
                println!("policy:        {}", usage.quota.overage_policy);
            }
            QuotaCommands::Stats => {
                let stats = plane.quotas().stats()?;
                println!("{} quotas, {} over their traffic limit", stats.total, stats.traffic_exceeded);
            }
        },
    }

    Ok(())
}
