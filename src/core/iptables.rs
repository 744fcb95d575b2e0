//! iptables/ip6tables backend
//!
//! This module turns a declarative [`Rule`] into the concrete argument lists
//! that `iptables` and `ip6tables` need to insert or remove it, and runs them.
//!
//! # Expansion
//!
//! One rule expands to the Cartesian product of its interfaces, remote and
//! local networks, port ranges, protocols, chains, ICMPv6 types, targets and
//! marks. Empty collections count as a single wildcard element, so every rule
//! compiles to at least one iptables rule per chain.
//!
//! # Generated grammar
//!
//! ```text
//! CHAIN [-i|-o IFACE] [-s|-d REMOTE] [-d|-s LOCAL] [-p PROTO]
//!       [-m mark|connmark --mark 0xMARK] [--sport|--dport MIN:MAX]
//!       [-m MODULE] [STATE_FLAG STATES [--ctorigsrc IP]] [--icmpv6-type N]
//!       [-m hl --hl-eq N] -m comment --comment TAG -j TARGET
//! ```
//!
//! The caller prepends `-t <table> <-I|-D>` and appends `-w <secs>`.
//!
//! # Ownership
//!
//! Every generated rule is tagged with a comment ([`DEFAULT_COMMENT`] unless
//! the rule overrides it). [`generate_flush_rules`] finds tagged rules in an
//! `iptables -S` dump, which is how [`IPTables::flush`] cleans up after a
//! restart without any in-memory state.

use crate::command::{CommandRunner, to_args};
use crate::config::FirewallConfig;
use crate::core::agent::Agent;
use crate::core::error::{Error, IptablesErrorPattern, Result};
use crate::core::rule::{ConnectionStates, Direction, PortsDirection, Rule};
use crate::utils::format_mark;
use ipnetwork::IpNetwork;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, warn};

pub const IPV4_TABLE: &str = "iptables";
pub const IPV6_TABLE: &str = "ip6tables";

/// Marker comment identifying rules owned by this program
pub const DEFAULT_COMMENT: &str = "nordvpn";

pub const FILTER_TABLE: &str = "filter";
pub const MANGLE_TABLE: &str = "mangle";

/// Tables swept by [`IPTables::flush`]
const USED_TABLES: [&str; 2] = [MANGLE_TABLE, FILTER_TABLE];

const CONNMARK_ARGS: [&str; 6] = [
    "CONNMARK",
    "--save-mark",
    "--nfmask",
    "0xffffffff",
    "--ctmask",
    "0xffffffff",
];

/// Built-in chains rules are attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleChain {
    Input,
    Output,
    Forward,
    Prerouting,
    Postrouting,
}

impl RuleChain {
    pub fn name(self) -> &'static str {
        match self {
            Self::Input => "INPUT",
            Self::Output => "OUTPUT",
            Self::Forward => "FORWARD",
            Self::Prerouting => "PREROUTING",
            Self::Postrouting => "POSTROUTING",
        }
    }

    /// Packets seen by this chain leave the host (or pass through it)
    fn is_outgoing(self) -> bool {
        !matches!(self, Self::Input | Self::Prerouting)
    }
}

/// What a matching packet jumps to (`-j`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTarget {
    Accept,
    Drop,
    /// Copies the packet mark to the connection
    Connmark,
}

impl RuleTarget {
    fn args(self) -> &'static [&'static str] {
        match self {
            Self::Accept => &["ACCEPT"],
            Self::Drop => &["DROP"],
            Self::Connmark => &CONNMARK_ARGS,
        }
    }
}

/// Inclusive port range; `min == 0` means "no port"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.min, self.max)
    }
}

/// Groups ports into contiguous ranges, sorted ascending.
pub fn ports_to_port_ranges(ports: &[u16]) -> Vec<PortRange> {
    let mut sorted = ports.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<PortRange> = Vec::new();
    for port in sorted {
        match ranges.last_mut() {
            Some(range) if range.max.checked_add(1) == Some(port) => range.max = port,
            _ => ranges.push(PortRange::new(port, port)),
        }
    }
    ranges
}

/// Chains a rule is attached to.
///
/// Physical rules use the routing hooks instead of the local socket ones.
pub fn to_chain_slice(direction: Direction, physical: bool) -> Vec<RuleChain> {
    let (incoming, outgoing) = if physical {
        (RuleChain::Prerouting, RuleChain::Postrouting)
    } else {
        (RuleChain::Input, RuleChain::Output)
    };
    match direction {
        Direction::Inbound => vec![incoming],
        Direction::Outbound => vec![outgoing],
        Direction::TwoWay => vec![incoming, outgoing],
        Direction::Forward => vec![RuleChain::Forward],
    }
}

/// Targets generated for one chain.
///
/// Marked traffic leaving the host additionally saves its mark to the
/// connection so replies can be routed the same way.
pub fn to_target_slice(allow: bool, chain: RuleChain, marks: &[u32]) -> Vec<RuleTarget> {
    let mut targets = vec![if allow {
        RuleTarget::Accept
    } else {
        RuleTarget::Drop
    }];
    if matches!(chain, RuleChain::Output | RuleChain::Postrouting)
        && marks.first().is_some_and(|&mark| mark != 0)
    {
        targets.push(RuleTarget::Connmark);
    }
    targets
}

fn ports_direction_flags(direction: PortsDirection) -> &'static [&'static str] {
    match direction {
        PortsDirection::SourceAndDestination => &["--sport", "--dport"],
        PortsDirection::Destination => &["--dport"],
        PortsDirection::Source => &["--sport"],
    }
}

static NO_STATES: ConnectionStates = ConnectionStates {
    states: Vec::new(),
    src_addr: None,
};

/// Everything that goes into one concrete iptables rule
#[derive(Debug, Clone, Copy)]
pub struct RuleParts<'a> {
    pub chain: RuleChain,
    pub target: RuleTarget,
    pub interface: &'a str,
    pub remote_network: Option<IpNetwork>,
    pub local_network: Option<IpNetwork>,
    pub protocol: &'a str,
    pub port_range: PortRange,
    /// `--sport` or `--dport`, used with a non-zero `port_range`
    pub port_flag: Option<&'a str>,
    /// Multiport lists, used only when `port_range` is empty
    pub source_ports: &'a [u16],
    pub destination_ports: &'a [u16],
    pub module: &'a str,
    pub state_flag: &'a str,
    pub states: &'a ConnectionStates,
    pub chain_prefix: &'a str,
    pub icmpv6_type: Option<u8>,
    pub hop_limit: Option<u8>,
    pub mark: u32,
    pub comment: &'a str,
}

impl RuleParts<'_> {
    /// Parts of a wildcard rule on `chain`
    pub fn new(chain: RuleChain, target: RuleTarget) -> Self {
        Self {
            chain,
            target,
            interface: "",
            remote_network: None,
            local_network: None,
            protocol: "",
            port_range: PortRange::default(),
            port_flag: None,
            source_ports: &[],
            destination_ports: &[],
            module: "",
            state_flag: "",
            states: &NO_STATES,
            chain_prefix: "",
            icmpv6_type: None,
            hop_limit: None,
            mark: 0,
            comment: "",
        }
    }
}

fn join_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Renders one concrete rule as an argument list starting with the chain name.
pub fn generate_iptables_rule(parts: &RuleParts<'_>) -> Vec<String> {
    let (remote_flag, local_flag, iface_flag) = if parts.chain.is_outgoing() {
        ("-d", "-s", "-o")
    } else {
        ("-s", "-d", "-i")
    };

    let mut args = vec![format!("{}{}", parts.chain_prefix, parts.chain.name())];

    if !parts.interface.is_empty() {
        args.extend(to_args([iface_flag, parts.interface]));
    }
    if let Some(remote) = parts.remote_network {
        args.extend([remote_flag.to_string(), remote.to_string()]);
    }
    if let Some(local) = parts.local_network {
        args.extend([local_flag.to_string(), local.to_string()]);
    }
    if !parts.protocol.is_empty() {
        args.extend(to_args(["-p", parts.protocol]));
    }
    if parts.mark != 0 {
        // the CONNMARK rule saves the packet mark, the others match the connection
        let module = if parts.target == RuleTarget::Connmark {
            "mark"
        } else {
            "connmark"
        };
        args.extend(to_args(["-m", module, "--mark"]));
        args.push(format_mark(parts.mark));
    }
    match parts.port_flag {
        Some(flag) if parts.port_range.min != 0 => {
            args.extend([flag.to_string(), parts.port_range.to_string()]);
        }
        _ => {
            if !parts.source_ports.is_empty() {
                args.extend(["--sport".to_string(), join_ports(parts.source_ports)]);
            }
            if !parts.destination_ports.is_empty() {
                args.extend(["--dport".to_string(), join_ports(parts.destination_ports)]);
            }
        }
    }

    if !parts.module.is_empty() {
        args.extend(to_args(["-m", parts.module]));
    }
    if !parts.state_flag.is_empty() && !parts.states.is_empty() {
        let states = parts
            .states
            .states
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        args.extend([parts.state_flag.to_string(), states]);
        if let Some(src) = parts.states.src_addr.filter(|ip| !ip.is_unspecified()) {
            args.extend(["--ctorigsrc".to_string(), src.to_string()]);
        }
    }

    if let Some(icmp_type) = parts.icmpv6_type {
        args.extend(["--icmpv6-type".to_string(), icmp_type.to_string()]);
    }
    if let Some(hop_limit) = parts.hop_limit.filter(|&hl| hl > 0) {
        args.extend(to_args(["-m", "hl", "--hl-eq"]));
        args.push(hop_limit.to_string());
    }

    let comment = if parts.comment.is_empty() {
        DEFAULT_COMMENT
    } else {
        parts.comment
    };
    args.extend(to_args(["-m", "comment", "--comment", comment, "-j"]));
    args.extend(to_args(parts.target.args().iter().copied()));
    args
}

/// Rules compiled for each binary, in generation order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledRules {
    pub ipv4: Vec<Vec<String>>,
    pub ipv6: Vec<Vec<String>>,
}

impl CompiledRules {
    /// Rules destined for the given binary, if it is one we compile for
    pub fn for_binary(&self, binary: &str) -> Option<&[Vec<String>]> {
        match binary {
            IPV4_TABLE => Some(&self.ipv4),
            IPV6_TABLE => Some(&self.ipv6),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.ipv4.len() + self.ipv6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A rule's collections with every empty one replaced by a single wildcard
struct Dimensions<'a> {
    interfaces: Vec<&'a str>,
    remote_networks: Vec<Option<IpNetwork>>,
    local_networks: Vec<Option<IpNetwork>>,
    port_ranges: Vec<PortRange>,
    protocols: Vec<&'a str>,
    icmpv6_types: Vec<Option<u8>>,
    marks: Vec<u32>,
}

fn or_wildcard<T>(items: Vec<T>, wildcard: T) -> Vec<T> {
    if items.is_empty() { vec![wildcard] } else { items }
}

impl<'a> Dimensions<'a> {
    fn of(rule: &'a Rule) -> Self {
        Self {
            interfaces: or_wildcard(
                rule.interfaces.iter().map(|i| i.name.as_str()).collect(),
                "",
            ),
            remote_networks: or_wildcard(
                rule.remote_networks.iter().copied().map(Some).collect(),
                None,
            ),
            local_networks: or_wildcard(
                rule.local_networks.iter().copied().map(Some).collect(),
                None,
            ),
            port_ranges: or_wildcard(
                ports_to_port_ranges(&rule.ports),
                PortRange::default(),
            ),
            protocols: or_wildcard(rule.protocols.iter().map(String::as_str).collect(), ""),
            icmpv6_types: or_wildcard(rule.icmpv6_types.iter().copied().map(Some).collect(), None),
            marks: or_wildcard(rule.marks.clone(), 0),
        }
    }
}

/// Which binaries a rule over these operands belongs to, as `(ipv4, ipv6)`.
///
/// Rules mixing address families cannot be expressed and belong to neither.
fn rule_families(
    remote: Option<IpNetwork>,
    local: Option<IpNetwork>,
    ipv6_only: bool,
) -> (bool, bool) {
    let has_v4 = [remote, local].iter().flatten().any(IpNetwork::is_ipv4);
    let has_v6 = [remote, local].iter().flatten().any(IpNetwork::is_ipv6);
    match (has_v4, has_v6) {
        (true, true) => (false, false),
        _ if ipv6_only => (false, !has_v4),
        (true, false) => (true, false),
        (false, true) => (false, true),
        (false, false) => (true, true),
    }
}

/// Expands a rule into concrete iptables and ip6tables rules.
///
/// `module` and `state_flag` are only emitted for rules with connection states.
pub fn rule_to_iptables(
    rule: &Rule,
    module: &str,
    state_flag: &str,
    chain_prefix: &str,
) -> CompiledRules {
    let dims = Dimensions::of(rule);
    let (module, state_flag) = if rule.connection_states.is_empty() {
        ("", "")
    } else {
        (module, state_flag)
    };
    let comment = rule.comment.as_deref().unwrap_or(DEFAULT_COMMENT);
    let mut compiled = CompiledRules::default();

    for &interface in &dims.interfaces {
        for &remote_network in &dims.remote_networks {
            for &local_network in &dims.local_networks {
                let (to_ipv4, to_ipv6) =
                    rule_families(remote_network, local_network, rule.ipv6_only);
                for &port_range in &dims.port_ranges {
                    for &protocol in &dims.protocols {
                        for chain in to_chain_slice(rule.direction, rule.physical) {
                            for &icmpv6_type in &dims.icmpv6_types {
                                for target in to_target_slice(rule.allow, chain, &dims.marks) {
                                    for &mark in &dims.marks {
                                        let base = RuleParts {
                                            interface,
                                            remote_network,
                                            local_network,
                                            protocol,
                                            port_range,
                                            source_ports: &rule.source_ports,
                                            destination_ports: &rule.destination_ports,
                                            module,
                                            state_flag,
                                            states: &rule.connection_states,
                                            chain_prefix,
                                            icmpv6_type,
                                            hop_limit: rule.hop_limit,
                                            mark,
                                            comment,
                                            ..RuleParts::new(chain, target)
                                        };
                                        // ICMPv6 matches only exist in ip6tables
                                        let to_ipv4 = to_ipv4 && icmpv6_type.is_none();
                                        push_rules(
                                            &mut compiled,
                                            &base,
                                            rule.ports_direction,
                                            to_ipv4,
                                            to_ipv6,
                                        );
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    compiled
}

fn push_rules(
    compiled: &mut CompiledRules,
    base: &RuleParts<'_>,
    ports_direction: PortsDirection,
    to_ipv4: bool,
    to_ipv6: bool,
) {
    let mut emit = |parts: &RuleParts<'_>| {
        let args = generate_iptables_rule(parts);
        if to_ipv4 {
            compiled.ipv4.push(args.clone());
        }
        if to_ipv6 {
            compiled.ipv6.push(args);
        }
    };

    if base.port_range.min == 0 {
        emit(base);
        return;
    }
    // one rule per flag: both flags in a single rule would be ANDed
    for &flag in ports_direction_flags(ports_direction) {
        emit(&RuleParts {
            port_flag: Some(flag),
            source_ports: &[],
            destination_ports: &[],
            ..*base
        });
    }
}

/// Builds delete invocations for every owned rule in an `iptables -S` dump.
///
/// Each result is a complete argument list (`-t <table> -D <chain> ...`).
pub fn generate_flush_rules(dump: &str, table: &str) -> Vec<Vec<String>> {
    dump.lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let (&first, rest) = tokens.split_first()?;
            let owned = tokens
                .windows(2)
                .any(|pair| pair[0] == "--comment" && pair[1] == DEFAULT_COMMENT);
            if first != "-A" || !owned {
                return None;
            }
            let mut args = to_args(["-t", table, "-D"]);
            args.extend(rest.iter().map(ToString::to_string));
            Some(args)
        })
        .collect()
}

/// Keeps the binaries that can list rules on this system.
pub fn filter_supported_tables(
    runner: &dyn CommandRunner,
    candidates: &[String],
    lock_wait_secs: u64,
) -> Vec<String> {
    let wait = lock_wait_secs.to_string();
    candidates
        .iter()
        .filter(|binary| match runner.run(binary, &to_args(["-S", "-w", wait.as_str()])) {
            Ok(_) => true,
            Err(e) => {
                warn!("{binary} is not usable, skipping it: {e}");
                false
            }
        })
        .cloned()
        .collect()
}

/// Firewall [`Agent`] backed by `iptables` and `ip6tables`
pub struct IPTables {
    state_module: String,
    state_flag: String,
    chain_prefix: String,
    lock_wait_secs: u64,
    supported_tables: Vec<String>,
    runner: Arc<dyn CommandRunner>,
    lock: Mutex<()>,
}

impl IPTables {
    /// Creates a backend for the given binaries, which are used as is.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        config: &FirewallConfig,
        supported_tables: Vec<String>,
    ) -> Self {
        Self {
            state_module: config.state_module.clone(),
            state_flag: config.state_flag.clone(),
            chain_prefix: config.chain_prefix.clone(),
            lock_wait_secs: config.lock_wait_secs,
            supported_tables,
            runner,
            lock: Mutex::new(()),
        }
    }

    /// Creates a backend for the configured binaries that work on this system.
    pub fn from_config(runner: Arc<dyn CommandRunner>, config: &FirewallConfig) -> Self {
        let supported =
            filter_supported_tables(runner.as_ref(), &config.tables, config.lock_wait_secs);
        Self::new(runner, config, supported)
    }

    pub fn supported_tables(&self) -> &[String] {
        &self.supported_tables
    }

    /// Compiles a rule with this backend's settings.
    pub fn compile(&self, rule: &Rule) -> CompiledRules {
        rule_to_iptables(rule, &self.state_module, &self.state_flag, &self.chain_prefix)
    }

    fn apply_rule(&self, rule: &Rule, add: bool) -> Result<()> {
        crate::validators::validate_rule(rule)?;

        let (flag, action) = if add {
            ("-I", "adding")
        } else {
            ("-D", "deleting")
        };
        let table = if rule.physical {
            MANGLE_TABLE
        } else {
            FILTER_TABLE
        };
        let wait = self.lock_wait_secs.to_string();
        let compiled = self.compile(rule);

        for binary in &self.supported_tables {
            let Some(rules) = compiled.for_binary(binary) else {
                continue;
            };
            for compiled_rule in rules {
                let mut args = to_args(["-t", table, flag]);
                args.extend(compiled_rule.iter().cloned());
                args.extend(to_args(["-w", wait.as_str()]));

                match self.runner.run(binary, &args) {
                    Ok(_) => {}
                    Err(Error::Execution { ref output, .. })
                        if !add && IptablesErrorPattern::is_missing_rule(output) =>
                    {
                        debug!(
                            "{binary} rule '{}' already absent",
                            compiled_rule.join(" ")
                        );
                    }
                    Err(e) => {
                        error!(
                            "Failed {action} {binary} rule '{}' for {}: {e}",
                            compiled_rule.join(" "),
                            rule.name
                        );
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }
}

impl Agent for IPTables {
    fn add(&self, rule: &Rule) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.apply_rule(rule, true)
    }

    fn delete(&self, rule: &Rule) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.apply_rule(rule, false)
    }

    /// Deletes every rule tagged with [`DEFAULT_COMMENT`] from the mangle and
    /// filter tables.
    ///
    /// Individual delete failures are logged and the sweep continues.
    fn flush(&self) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let wait = self.lock_wait_secs.to_string();
        let mut failed = 0;

        for table in USED_TABLES {
            for binary in &self.supported_tables {
                let dump = self
                    .runner
                    .run(binary, &to_args(["-t", table, "-S", "-w", wait.as_str()]))?;
                let dump = String::from_utf8_lossy(&dump);
                for args in generate_flush_rules(&dump, table) {
                    if let Err(e) = self.runner.run(binary, &args) {
                        warn!("{binary} failed to delete rule '{}': {e}", args.join(" "));
                        failed += 1;
                    }
                }
            }
        }

        if failed > 0 {
            return Err(Error::FlushIncomplete { failed });
        }
        Ok(())
    }
}
