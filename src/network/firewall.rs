//! Firewall rule applier
//!
//! The NAT manager only talks to [`FirewallApplier`]. [`IptablesFirewall`]
//! shells out to iptables/ip6tables and tags every rule with a comment so
//! reconciliation can find and flush them; [`MemoryFirewall`] keeps rules
//! in a set for dry runs and tests.

use crate::config::FirewallConfig;
use crate::error::{NetplaneError, Result};
use crate::exec::{args, CommandRunner};
use crate::store::{PortMapping, Protocol};
use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use tracing::{debug, warn};

/// One port-forwarding rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForwardRule {
    pub protocol: Protocol,
    pub external_port: u16,
    pub target: IpAddr,
    pub internal_port: u16,
}

impl ForwardRule {
    pub fn new(protocol: Protocol, external_port: u16, target: IpAddr, internal_port: u16) -> Self {
        Self {
            protocol,
            external_port,
            target,
            internal_port,
        }
    }
}

impl From<&PortMapping> for ForwardRule {
    fn from(mapping: &PortMapping) -> Self {
        Self::new(
            mapping.protocol,
            mapping.external_port,
            mapping.target_address,
            mapping.internal_port,
        )
    }
}

impl std::fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.target {
            IpAddr::V4(v4) => write!(
                f,
                "{}/{} -> {}:{}",
                self.external_port, self.protocol, v4, self.internal_port
            ),
            IpAddr::V6(v6) => write!(
                f,
                "{}/{} -> [{}]:{}",
                self.external_port, self.protocol, v6, self.internal_port
            ),
        }
    }
}

/// Applies and removes forwarding rules
///
/// `apply` must be idempotent. `remove` is best-effort: callers log its
/// failure and carry on.
pub trait FirewallApplier: Send + Sync {
    fn apply(&self, rule: &ForwardRule) -> Result<()>;
    fn remove(&self, rule: &ForwardRule) -> Result<()>;
    /// Remove every rule this process ever applied
    fn clear_managed(&self) -> Result<()>;
}

/// iptables-backed applier
pub struct IptablesFirewall {
    runner: CommandRunner,
    config: FirewallConfig,
}

impl IptablesFirewall {
    pub fn new(runner: CommandRunner, config: FirewallConfig) -> Self {
        Self { runner, config }
    }

    fn binary(&self, target: &IpAddr) -> &str {
        match target {
            IpAddr::V4(_) => &self.config.iptables,
            IpAddr::V6(_) => &self.config.ip6tables,
        }
    }

    fn destination(rule: &ForwardRule) -> String {
        match rule.target {
            IpAddr::V4(v4) => format!("{}:{}", v4, rule.internal_port),
            IpAddr::V6(v6) => format!("[{}]:{}", v6, rule.internal_port),
        }
    }

    fn comment(tag: &str) -> Vec<String> {
        args(["-m", "comment", "--comment", tag])
    }

    /// Comment identifying the rules of one mapping
    ///
    /// Two mappings onto the same target and port would otherwise share a
    /// FORWARD rule, and removing one would cut off the other.
    fn rule_tag(&self, rule: &ForwardRule) -> String {
        format!("{}-{}-{}", self.config.rule_tag, rule.external_port, rule.protocol)
    }

    /// DNAT rule spec (without table/action)
    fn dnat_spec(&self, rule: &ForwardRule) -> Vec<String> {
        let mut spec = args([
            "PREROUTING",
            "-p",
            rule.protocol.as_str(),
            "--dport",
            rule.external_port.to_string().as_str(),
            "-j",
            "DNAT",
            "--to-destination",
            Self::destination(rule).as_str(),
        ]);
        spec.extend(Self::comment(&self.rule_tag(rule)));
        spec
    }

    fn forward_spec(&self, rule: &ForwardRule) -> Vec<String> {
        let mut spec = args([
            "FORWARD",
            "-p",
            rule.protocol.as_str(),
            "-d",
            rule.target.to_string().as_str(),
            "--dport",
            rule.internal_port.to_string().as_str(),
            "-j",
            "ACCEPT",
        ]);
        spec.extend(Self::comment(&self.rule_tag(rule)));
        spec
    }

    /// Shared by every mapping onto the target
    fn masquerade_spec(&self, rule: &ForwardRule) -> Vec<String> {
        let mut spec = args(["POSTROUTING", "-s", rule.target.to_string().as_str(), "-j", "MASQUERADE"]);
        spec.extend(Self::comment(&self.config.rule_tag));
        spec
    }

    /// The (table, spec) pairs installed for one rule
    fn specs(&self, rule: &ForwardRule) -> Vec<(&'static str, Vec<String>)> {
        vec![
            ("nat", self.dnat_spec(rule)),
            ("filter", self.forward_spec(rule)),
            ("nat", self.masquerade_spec(rule)),
        ]
    }

    fn command(table: &str, action: &str, spec: &[String]) -> Vec<String> {
        let mut cmd = args(["-t", table, action]);
        cmd.extend(spec.iter().cloned());
        cmd
    }

    /// Add a rule unless an identical one is already installed
    ///
    /// Returns whether this call added it.
    fn ensure(&self, binary: &str, table: &str, spec: &[String]) -> Result<bool> {
        let check = self.runner.output(binary, &Self::command(table, "-C", spec))?;
        if check.success {
            return Ok(false);
        }
        self.runner.run(binary, &Self::command(table, "-A", spec))?;
        Ok(true)
    }

    fn flush_table(&self, binary: &str, table: &str) -> Result<usize> {
        let listing = self.runner.run(binary, &args(["-t", table, "-S"]))?;
        // matches the shared tag and every per-mapping `<tag>-<port>-<proto>`
        let bare = format!("--comment {}", self.config.rule_tag);
        let quoted = format!("--comment \"{}", self.config.rule_tag);
        let mut removed = 0;

        for line in listing.lines() {
            if !line.starts_with("-A ") || !(line.contains(&bare) || line.contains(&quoted)) {
                continue;
            }
            let mut cmd = args(["-t", table, "-D"]);
            cmd.extend(line.split_whitespace().skip(1).map(|s| s.trim_matches('"').to_string()));
            self.runner.run(binary, &cmd)?;
            removed += 1;
        }

        Ok(removed)
    }
}

impl FirewallApplier for IptablesFirewall {
    fn apply(&self, rule: &ForwardRule) -> Result<()> {
        let binary = self.binary(&rule.target).to_string();
        let specs = self.specs(rule);

        let mut added: Vec<&(&str, Vec<String>)> = Vec::new();

        for entry in &specs {
            let (table, spec) = entry;
            match self.ensure(&binary, table, spec) {
                Ok(true) => added.push(entry),
                Ok(false) => {}
                Err(e) => {
                    // only undo rules this call installed
                    for (table, spec) in added.into_iter().rev() {
                        if let Err(undo) = self.runner.run(&binary, &Self::command(table, "-D", spec)) {
                            warn!("Failed to roll back {} rule for {}: {}", table, rule, undo);
                        }
                    }
                    return Err(NetplaneError::FirewallApply(format!("{}: {}", rule, e)));
                }
            }
        }

        debug!("Applied firewall rule {}", rule);
        Ok(())
    }

    fn remove(&self, rule: &ForwardRule) -> Result<()> {
        let binary = self.binary(&rule.target).to_string();
        let mut failures = Vec::new();

        // MASQUERADE is shared by every mapping of the target and stays until the next flush
        for (table, spec) in [("nat", self.dnat_spec(rule)), ("filter", self.forward_spec(rule))] {
            if let Err(e) = self.runner.run(&binary, &Self::command(table, "-D", &spec)) {
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            debug!("Removed firewall rule {}", rule);
            Ok(())
        } else {
            Err(NetplaneError::FirewallApply(format!("{}: {}", rule, failures.join("; "))))
        }
    }

    fn clear_managed(&self) -> Result<()> {
        let mut removed = 0;
        for binary in [self.config.iptables.clone(), self.config.ip6tables.clone()] {
            for table in ["nat", "filter"] {
                match self.flush_table(&binary, table) {
                    Ok(n) => removed += n,
                    Err(e) => {
                        return Err(NetplaneError::FirewallApply(format!(
                            "flushing {} {} rules: {}",
                            binary, table, e
                        )))
                    }
                }
            }
        }
        debug!("Flushed {} managed firewall rules", removed);
        Ok(())
    }
}

#[derive(Default)]
struct MemoryFirewallState {
    rules: BTreeSet<ForwardRule>,
    failing_ports: HashSet<u16>,
    fail_removals: bool,
    applies: usize,
}

/// In-memory applier
#[derive(Default)]
pub struct MemoryFirewall {
    state: Mutex<MemoryFirewallState>,
}

impl MemoryFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, MemoryFirewallState>> {
        self.state
            .lock()
            .map_err(|_| NetplaneError::Lock("Failed to acquire firewall lock".to_string()))
    }

    /// Currently installed rules, ordered
    pub fn rules(&self) -> Vec<ForwardRule> {
        self.state()
            .map(|s| s.rules.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of successful `apply` calls so far
    pub fn apply_count(&self) -> usize {
        self.state().map(|s| s.applies).unwrap_or_default()
    }

    /// Make `apply` fail for rules on this external port
    pub fn fail_port(&self, port: u16) {
        if let Ok(mut state) = self.state() {
            state.failing_ports.insert(port);
        }
    }

    /// Make every `remove` fail
    pub fn fail_removals(&self, fail: bool) {
        if let Ok(mut state) = self.state() {
            state.fail_removals = fail;
        }
    }

    /// Install a rule behind the manager's back
    pub fn inject(&self, rule: ForwardRule) {
        if let Ok(mut state) = self.state() {
            state.rules.insert(rule);
        }
    }
}

impl FirewallApplier for MemoryFirewall {
    fn apply(&self, rule: &ForwardRule) -> Result<()> {
        let mut state = self.state()?;
        if state.failing_ports.contains(&rule.external_port) {
            return Err(NetplaneError::FirewallApply(format!("{}: rejected", rule)));
        }
        state.rules.insert(*rule);
        state.applies += 1;
        Ok(())
    }

    fn remove(&self, rule: &ForwardRule) -> Result<()> {
        let mut state = self.state()?;
        if state.fail_removals {
            warn!("[dry-run] refusing to remove {}", rule);
            return Err(NetplaneError::FirewallApply(format!("{}: removal rejected", rule)));
        }
        state.rules.remove(rule);
        Ok(())
    }

    fn clear_managed(&self) -> Result<()> {
        self.state()?.rules.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(port: u16) -> ForwardRule {
        ForwardRule::new(Protocol::Tcp, port, "10.0.1.5".parse().unwrap(), 80)
    }

    #[test]
    fn test_rule_display() {
        assert_eq!(rule(8080).to_string(), "8080/tcp -> 10.0.1.5:80");
        let v6 = ForwardRule::new(Protocol::Udp, 53, "2001:db8::5".parse().unwrap(), 5353);
        assert_eq!(v6.to_string(), "53/udp -> [2001:db8::5]:5353");
    }

    fn runner() -> CommandRunner {
        CommandRunner::new(std::time::Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn test_iptables_specs_are_tagged() {
        let firewall = IptablesFirewall::new(runner(), FirewallConfig::default());
        let specs = firewall.specs(&rule(8080));

        assert_eq!(specs.len(), 3);
        assert_eq!(
            specs[0].1.join(" "),
            "PREROUTING -p tcp --dport 8080 -j DNAT --to-destination 10.0.1.5:80 -m comment --comment netplane-8080-tcp"
        );
        assert_eq!(
            specs[1].1.join(" "),
            "FORWARD -p tcp -d 10.0.1.5 --dport 80 -j ACCEPT -m comment --comment netplane-8080-tcp"
        );
        assert_eq!(
            specs[2].1.join(" "),
            "POSTROUTING -s 10.0.1.5 -j MASQUERADE -m comment --comment netplane"
        );
        assert_eq!(firewall.binary(&"2001:db8::1".parse().unwrap()), "ip6tables");
    }

    #[test]
    fn test_mappings_onto_same_target_get_distinct_rules() {
        let firewall = IptablesFirewall::new(runner(), FirewallConfig::default());
        let a = firewall.specs(&rule(8080));
        let b = firewall.specs(&rule(8081));
        assert_ne!(a[1].1, b[1].1);
        assert_eq!(a[2].1, b[2].1);
    }

    /// Fake iptables that keeps its rules in a `rules` file beside itself.
    /// A rule matching any line of a `fail` file is refused on `-A`.
    #[cfg(unix)]
    mod scripted {
        use super::*;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::path::{Path, PathBuf};
        use tempfile::TempDir;

        const FAKE_IPTABLES: &str = r#"#!/bin/sh
dir=$(dirname "$0")
state="$dir/rules"
touch "$state"
table=$2
action=$3
shift 3
rule="$table $*"
case "$action" in
  -C) grep -qxF -- "$rule" "$state" ;;
  -A)
    if [ -f "$dir/fail" ] && printf '%s\n' "$rule" | grep -qF -f "$dir/fail"; then
      echo "iptables: rule rejected" >&2
      exit 1
    fi
    printf '%s\n' "$rule" >> "$state" ;;
  -D)
    grep -qxF -- "$rule" "$state" || { echo "iptables: Bad rule" >&2; exit 1; }
    awk -v r="$rule" 'done || $0 != r { print; next } { done = 1 }' "$state" > "$state.next"
    mv "$state.next" "$state" ;;
  -S) grep "^$table " "$state" | sed "s/^$table /-A /" ;;
  *) exit 2 ;;
esac
"#;

        struct FakeIptables {
            dir: TempDir,
            firewall: IptablesFirewall,
        }

        impl FakeIptables {
            fn new() -> Self {
                let dir = TempDir::new().unwrap();
                let script = dir.path().join("iptables");
                fs::write(&script, FAKE_IPTABLES).unwrap();
                fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

                let config = FirewallConfig {
                    iptables: script.display().to_string(),
                    ip6tables: script.display().to_string(),
                    rule_tag: "netplane".to_string(),
                };
                let firewall = IptablesFirewall::new(runner(), config);
                Self { dir, firewall }
            }

            fn state(&self) -> PathBuf {
                self.dir.path().join("rules")
            }

            fn rules(&self) -> Vec<String> {
                read_lines(&self.state())
            }

            fn chain(&self, chain: &str) -> Vec<String> {
                self.rules()
                    .into_iter()
                    .filter(|r| r.split_whitespace().nth(1) == Some(chain))
                    .collect()
            }

            fn refuse(&self, pattern: &str) {
                fs::write(self.dir.path().join("fail"), format!("{}\n", pattern)).unwrap();
            }
        }

        fn read_lines(path: &Path) -> Vec<String> {
            fs::read_to_string(path)
                .unwrap_or_default()
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()
        }

        #[test]
        fn test_apply_installs_each_rule_once() {
            let fake = FakeIptables::new();
            fake.firewall.apply(&rule(8080)).unwrap();
            fake.firewall.apply(&rule(8080)).unwrap();

            assert_eq!(fake.rules().len(), 3);
            assert_eq!(fake.chain("PREROUTING").len(), 1);
            assert_eq!(fake.chain("FORWARD").len(), 1);
            assert_eq!(fake.chain("POSTROUTING").len(), 1);
        }

        #[test]
        fn test_remove_keeps_rules_of_other_mapping_on_same_target() {
            let fake = FakeIptables::new();
            fake.firewall.apply(&rule(8080)).unwrap();
            fake.firewall.apply(&rule(8081)).unwrap();
            assert_eq!(fake.chain("FORWARD").len(), 2);
            assert_eq!(fake.chain("POSTROUTING").len(), 1);

            fake.firewall.remove(&rule(8080)).unwrap();

            let forward = fake.chain("FORWARD");
            assert_eq!(forward.len(), 1);
            assert!(forward[0].ends_with("--comment netplane-8081-tcp"));
            let dnat = fake.chain("PREROUTING");
            assert_eq!(dnat.len(), 1);
            assert!(dnat[0].contains("--dport 8081"));
            assert_eq!(fake.chain("POSTROUTING").len(), 1);
        }

        #[test]
        fn test_remove_reports_missing_rules() {
            let fake = FakeIptables::new();
            let err = fake.firewall.remove(&rule(8080)).unwrap_err();
            assert!(matches!(err, NetplaneError::FirewallApply(_)));
        }

        #[test]
        fn test_failed_apply_rolls_back_only_its_own_rules() {
            let fake = FakeIptables::new();
            fake.refuse("MASQUERADE");

            let err = fake.firewall.apply(&rule(8080)).unwrap_err();
            assert!(matches!(err, NetplaneError::FirewallApply(_)));
            assert!(fake.rules().is_empty());

            // a rule that was already installed survives the rollback
            let dnat = format!("nat {}", fake.firewall.specs(&rule(9090))[0].1.join(" "));
            fs::write(fake.state(), format!("{}\n", dnat)).unwrap();
            fake.refuse("FORWARD -p tcp -d 10.0.1.5 --dport 80");

            assert!(fake.firewall.apply(&rule(9090)).is_err());
            assert_eq!(fake.rules(), vec![dnat]);
        }

        #[test]
        fn test_clear_managed_flushes_only_tagged_rules() {
            let fake = FakeIptables::new();
            fake.firewall.apply(&rule(8080)).unwrap();
            fake.firewall.apply(&rule(8081)).unwrap();
            fs::write(
                fake.state(),
                format!(
                    "{}\nfilter INPUT -p tcp --dport 22 -j ACCEPT\n",
                    fake.rules().join("\n")
                ),
            )
            .unwrap();

            fake.firewall.clear_managed().unwrap();

            assert_eq!(fake.rules(), vec!["filter INPUT -p tcp --dport 22 -j ACCEPT".to_string()]);
        }
    }

    #[test]
    fn test_memory_firewall_apply_is_idempotent() {
        let firewall = MemoryFirewall::new();
        firewall.apply(&rule(8080)).unwrap();
        firewall.apply(&rule(8080)).unwrap();
        assert_eq!(firewall.rules(), vec![rule(8080)]);
        assert_eq!(firewall.apply_count(), 2);
    }

    #[test]
    fn test_memory_firewall_failure_injection() {
        let firewall = MemoryFirewall::new();
        firewall.fail_port(9000);
        assert!(firewall.apply(&rule(9000)).is_err());
        assert!(firewall.rules().is_empty());

        firewall.apply(&rule(8080)).unwrap();
        firewall.fail_removals(true);
        assert!(firewall.remove(&rule(8080)).is_err());
        assert_eq!(firewall.rules().len(), 1);

        firewall.clear_managed().unwrap();
        assert!(firewall.rules().is_empty());
    }
}
