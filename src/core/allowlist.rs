//! Allowlist routing
//!
//! Traffic to allowlisted ports and subnets bypasses the tunnel. It is
//! recognised here by marking it in the `mangle` table; policy routing keyed
//! on that mark sends it out the physical interface.
//!
//! All rules carry [`ALLOWLIST_COMMENT`] so [`Routing::disable`] can find and
//! remove them again without keeping state.

use crate::command::{CommandRunner, to_args};
use crate::config::FirewallConfig;
use crate::core::error::{Error, IptablesErrorPattern, Result};
use crate::core::iptables::{
    IPV4_TABLE, IPV6_TABLE, MANGLE_TABLE, filter_supported_tables, ports_to_port_ranges,
};
use crate::utils::format_mark;
use crate::validators::validate_protocol;
use ipnetwork::IpNetwork;
use std::sync::Arc;
use tracing::{debug, error};

/// Comment tagging every allowlist routing rule
pub const ALLOWLIST_COMMENT: &str = "nordvpn_allowlist";

const ROUTING_CHAINS: [&str; 2] = ["PREROUTING", "OUTPUT"];

/// List/delete cycles attempted per chain before giving up on a cleanup
const MAX_CLEANUP_PASSES: usize = 8;

/// Marks allowlisted traffic for policy routing
pub trait Routing: Send + Sync {
    /// Marks traffic to and from local `ports` over `protocol`.
    fn enable_ports(&self, ports: &[u16], protocol: &str, mark: u32) -> Result<()>;

    /// Marks traffic exchanged with `subnets`.
    fn enable_subnets(&self, subnets: &[IpNetwork], mark: u32) -> Result<()>;

    /// Removes every allowlist routing rule.
    fn disable(&self) -> Result<()>;
}

/// [`Routing`] implemented with iptables `MARK` rules
pub struct AllowlistRouting {
    runner: Arc<dyn CommandRunner>,
    supported_tables: Vec<String>,
    lock_wait_secs: u64,
    mark: u32,
}

impl AllowlistRouting {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        supported_tables: Vec<String>,
        lock_wait_secs: u64,
    ) -> Self {
        Self {
            runner,
            supported_tables,
            lock_wait_secs,
            mark: FirewallConfig::default().allowlist_mark,
        }
    }

    /// Creates routing for the configured binaries that work on this system,
    /// marking with the configured allowlist mark.
    pub fn from_config(runner: Arc<dyn CommandRunner>, config: &FirewallConfig) -> Self {
        let supported =
            filter_supported_tables(runner.as_ref(), &config.tables, config.lock_wait_secs);
        Self {
            mark: config.allowlist_mark,
            ..Self::new(runner, supported, config.lock_wait_secs)
        }
    }

    /// Mark used by [`Self::allow_ports`] and [`Self::allow_subnets`]
    pub fn mark(&self) -> u32 {
        self.mark
    }

    /// [`Routing::enable_ports`] with the configured mark
    pub fn allow_ports(&self, ports: &[u16], protocol: &str) -> Result<()> {
        self.enable_ports(ports, protocol, self.mark)
    }

    /// [`Routing::enable_subnets`] with the configured mark
    pub fn allow_subnets(&self, subnets: &[IpNetwork]) -> Result<()> {
        self.enable_subnets(subnets, self.mark)
    }

    fn supports(&self, binary: &str) -> bool {
        self.supported_tables.iter().any(|t| t == binary)
    }

    fn mangle_args(&self, op: &str, chain: &str, rule: &[String]) -> Vec<String> {
        let mut args = to_args(["-t", MANGLE_TABLE, op, chain]);
        args.extend(rule.iter().cloned());
        args.extend(["-w".to_string(), self.lock_wait_secs.to_string()]);
        args
    }

    /// Inserts the rule unless an identical one is already present.
    fn ensure_rule(&self, binary: &str, chain: &str, rule: &[String]) -> Result<()> {
        match self.runner.run(binary, &self.mangle_args("-C", chain, rule)) {
            Ok(_) => {
                debug!("Allowlist rule already present in {chain}: {}", rule.join(" "));
                return Ok(());
            }
            Err(Error::Execution { ref output, .. })
                if IptablesErrorPattern::is_missing_rule(output) => {}
            Err(e) => return Err(e),
        }

        self.runner
            .run(binary, &self.mangle_args("-I", chain, rule))
            .map(|_| ())
            .inspect_err(|e| error!("Failed to add allowlist rule to {chain}: {e}"))
    }

    /// Deletes owned rules from one chain until a listing shows none left.
    fn cleanup_chain(&self, binary: &str, chain: &str) -> Result<()> {
        let wait = self.lock_wait_secs.to_string();
        for pass in 0..MAX_CLEANUP_PASSES {
            let listing = self.runner.run(
                binary,
                &to_args([
                    "-t",
                    MANGLE_TABLE,
                    "-L",
                    chain,
                    "-v",
                    "-n",
                    "--line-numbers",
                    "-w",
                    wait.as_str(),
                ]),
            )?;
            let mut numbers = owned_line_numbers(&String::from_utf8_lossy(&listing));
            if numbers.is_empty() {
                return Ok(());
            }
            debug!(
                "Allowlist cleanup pass {pass}: removing {} rule(s) from {binary} {chain}",
                numbers.len()
            );
            // highest first so the remaining numbers stay valid
            numbers.sort_unstable_by(|a, b| b.cmp(a));
            for number in numbers {
                let number = number.to_string();
                let args = to_args([
                    "-t",
                    MANGLE_TABLE,
                    "-D",
                    chain,
                    number.as_str(),
                    "-w",
                    wait.as_str(),
                ]);
                self.runner.run(binary, &args)?;
            }
        }
        Err(Error::CleanupLimit {
            chain: chain.to_string(),
            attempts: MAX_CLEANUP_PASSES,
        })
    }
}

fn with_mark(mut rule: Vec<String>, mark: u32) -> Vec<String> {
    rule.extend(to_args([
        "-m",
        "comment",
        "--comment",
        ALLOWLIST_COMMENT,
        "-j",
        "MARK",
        "--set-mark",
    ]));
    rule.push(format_mark(mark));
    rule
}

/// Line numbers of tagged rules in `iptables -L -v -n --line-numbers` output.
///
/// Comments are listed as `/* tag */`, the tag must match a whole token.
fn owned_line_numbers(listing: &str) -> Vec<usize> {
    listing
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let number = tokens.next()?.parse::<usize>().ok()?;
            tokens.any(|t| t == ALLOWLIST_COMMENT).then_some(number)
        })
        .collect()
}

impl Routing for AllowlistRouting {
    fn enable_ports(&self, ports: &[u16], protocol: &str, mark: u32) -> Result<()> {
        let protocol = validate_protocol(protocol).map_err(|message| Error::Validation {
            field: "protocol".to_string(),
            message,
        })?;
        // port rules are IPv4 only
        if !self.supports(IPV4_TABLE) {
            debug!("Skipping allowlisted ports: {IPV4_TABLE} not available");
            return Ok(());
        }

        for range in ports_to_port_ranges(ports) {
            if range.min == 0 {
                continue;
            }
            let range = range.to_string();
            let prerouting = with_mark(
                to_args(["-p", protocol.as_str(), "--dport", range.as_str()]),
                mark,
            );
            let output = with_mark(
                to_args(["-p", protocol.as_str(), "--sport", range.as_str()]),
                mark,
            );
            self.ensure_rule(IPV4_TABLE, "PREROUTING", &prerouting)?;
            self.ensure_rule(IPV4_TABLE, "OUTPUT", &output)?;
        }
        Ok(())
    }

    fn enable_subnets(&self, subnets: &[IpNetwork], mark: u32) -> Result<()> {
        for subnet in subnets {
            let binary = if subnet.is_ipv4() {
                IPV4_TABLE
            } else {
                IPV6_TABLE
            };
            if !self.supports(binary) {
                debug!("Skipping allowlisted subnet {subnet}: {binary} not available");
                continue;
            }
            let subnet = subnet.to_string();
            let prerouting = with_mark(
                to_args(["-s", subnet.as_str(), "-m", "conntrack", "--ctstate", "NEW"]),
                mark,
            );
            let output = with_mark(to_args(["-d", subnet.as_str()]), mark);
            self.ensure_rule(binary, "PREROUTING", &prerouting)?;
            self.ensure_rule(binary, "OUTPUT", &output)?;
        }
        Ok(())
    }

    fn disable(&self) -> Result<()> {
        for binary in &self.supported_tables {
            for chain in ROUTING_CHAINS {
                self.cleanup_chain(binary, chain)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::RecordingRunner;

    fn routing(runner: &Arc<RecordingRunner>) -> AllowlistRouting {
        AllowlistRouting::new(
            runner.clone(),
            vec![IPV4_TABLE.to_string(), IPV6_TABLE.to_string()],
            5,
        )
    }

    const LISTING: &str = "\
Chain PREROUTING (policy ACCEPT 0 packets, 0 bytes)
num   pkts bytes target     prot opt in     out     source               destination
1        0     0 MARK       6    --  *      *       0.0.0.0/0            0.0.0.0/0            tcp dpt:22 /* nordvpn_allowlist */ MARK set 0xe1f1
2        0     0 ACCEPT     0    --  *      *       0.0.0.0/0            0.0.0.0/0            /* nordvpn */
3        0     0 MARK       0    --  *      *       192.168.1.0/24       0.0.0.0/0            ctstate NEW /* nordvpn_allowlist */ MARK set 0xe1f1
";

    #[test]
    fn test_owned_line_numbers() {
        assert_eq!(owned_line_numbers(LISTING), vec![1, 3]);
        assert!(owned_line_numbers("").is_empty());
        assert!(owned_line_numbers("Chain OUTPUT (policy ACCEPT)\nnum pkts").is_empty());
    }

    #[test]
    fn test_enable_ports_groups_ranges() {
        let runner = Arc::new(RecordingRunner::new().missing_rule_on(" -C "));
        routing(&runner).enable_ports(&[22, 23, 80], "tcp", 0xe1f1).unwrap();

        let inserts: Vec<String> = runner
            .commands()
            .into_iter()
            .filter(|c| c.contains(" -I "))
            .collect();
        assert_eq!(
            inserts,
            vec![
                "iptables -t mangle -I PREROUTING -p tcp --dport 22:23 -m comment --comment nordvpn_allowlist -j MARK --set-mark 0xe1f1 -w 5",
                "iptables -t mangle -I OUTPUT -p tcp --sport 22:23 -m comment --comment nordvpn_allowlist -j MARK --set-mark 0xe1f1 -w 5",
                "iptables -t mangle -I PREROUTING -p tcp --dport 80:80 -m comment --comment nordvpn_allowlist -j MARK --set-mark 0xe1f1 -w 5",
                "iptables -t mangle -I OUTPUT -p tcp --sport 80:80 -m comment --comment nordvpn_allowlist -j MARK --set-mark 0xe1f1 -w 5",
            ]
        );
    }

    #[test]
    fn test_enable_ports_is_idempotent() {
        // every -C succeeds: the rules are already there
        let runner = Arc::new(RecordingRunner::new());
        routing(&runner).enable_ports(&[22], "udp", 0xe1f1).unwrap();

        let commands = runner.commands();
        assert_eq!(commands.len(), 2);
        assert!(commands.iter().all(|c| c.contains(" -C ")));
    }

    #[test]
    fn test_enable_ports_without_iptables() {
        let runner = Arc::new(RecordingRunner::new().missing_rule_on(" -C "));
        let routing = AllowlistRouting::new(runner.clone(), vec![IPV6_TABLE.to_string()], 5);
        routing.enable_ports(&[22], "tcp", 0xe1f1).unwrap();
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn test_from_config_uses_configured_mark() {
        let runner = Arc::new(
            RecordingRunner::new()
                .fail_on("ip6tables -S")
                .missing_rule_on(" -C "),
        );
        let config = FirewallConfig {
            allowlist_mark: 0x2a,
            lock_wait_secs: 1,
            ..FirewallConfig::default()
        };
        let routing = AllowlistRouting::from_config(runner.clone(), &config);
        assert_eq!(routing.mark(), 0x2a);

        runner.clear();
        let subnets: Vec<IpNetwork> = vec![
            "10.0.0.0/8".parse().unwrap(),
            "fd00::/8".parse().unwrap(),
        ];
        routing.allow_subnets(&subnets).unwrap();
        routing.allow_ports(&[53], "udp").unwrap();

        let inserts: Vec<String> = runner
            .commands()
            .into_iter()
            .filter(|c| c.contains(" -I "))
            .collect();
        assert_eq!(
            inserts,
            vec![
                "iptables -t mangle -I PREROUTING -s 10.0.0.0/8 -m conntrack --ctstate NEW -m comment --comment nordvpn_allowlist -j MARK --set-mark 0x2a -w 1",
                "iptables -t mangle -I OUTPUT -d 10.0.0.0/8 -m comment --comment nordvpn_allowlist -j MARK --set-mark 0x2a -w 1",
                "iptables -t mangle -I PREROUTING -p udp --dport 53:53 -m comment --comment nordvpn_allowlist -j MARK --set-mark 0x2a -w 1",
                "iptables -t mangle -I OUTPUT -p udp --sport 53:53 -m comment --comment nordvpn_allowlist -j MARK --set-mark 0x2a -w 1",
            ]
        );
    }

    #[test]
    fn test_enable_ports_rejects_bad_protocol() {
        let runner = Arc::new(RecordingRunner::new());
        let result = routing(&runner).enable_ports(&[22], "tcp -j DROP", 0xe1f1);
        assert!(matches!(result, Err(Error::Validation { .. })));
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn test_enable_subnets_by_family() {
        let runner = Arc::new(RecordingRunner::new().missing_rule_on(" -C "));
        let subnets: Vec<IpNetwork> = vec![
            "192.168.1.0/24".parse().unwrap(),
            "fd00::/8".parse().unwrap(),
        ];
        routing(&runner).enable_subnets(&subnets, 0x1).unwrap();

        let inserts: Vec<String> = runner
            .commands()
            .into_iter()
            .filter(|c| c.contains(" -I "))
            .collect();
        assert_eq!(
            inserts,
            vec![
                "iptables -t mangle -I PREROUTING -s 192.168.1.0/24 -m conntrack --ctstate NEW -m comment --comment nordvpn_allowlist -j MARK --set-mark 0x1 -w 5",
                "iptables -t mangle -I OUTPUT -d 192.168.1.0/24 -m comment --comment nordvpn_allowlist -j MARK --set-mark 0x1 -w 5",
                "ip6tables -t mangle -I PREROUTING -s fd00::/8 -m conntrack --ctstate NEW -m comment --comment nordvpn_allowlist -j MARK --set-mark 0x1 -w 5",
                "ip6tables -t mangle -I OUTPUT -d fd00::/8 -m comment --comment nordvpn_allowlist -j MARK --set-mark 0x1 -w 5",
            ]
        );
    }

    #[test]
    fn test_check_failure_is_reported() {
        let runner = Arc::new(RecordingRunner::new().fail_on(" -C "));
        let subnets: Vec<IpNetwork> = vec!["10.0.0.0/8".parse().unwrap()];
        let result = routing(&runner).enable_subnets(&subnets, 0x1);
        assert!(matches!(result, Err(Error::Execution { .. })));
        assert_eq!(runner.commands().len(), 1);
    }

    #[test]
    fn test_disable_deletes_highest_line_first() {
        let runner = Arc::new(
            RecordingRunner::new()
                .with_output_once("iptables -t mangle -L PREROUTING", LISTING),
        );
        let routing = AllowlistRouting::new(runner.clone(), vec![IPV4_TABLE.to_string()], 5);
        routing.disable().unwrap();

        assert_eq!(
            runner.commands(),
            vec![
                "iptables -t mangle -L PREROUTING -v -n --line-numbers -w 5",
                "iptables -t mangle -D PREROUTING 3 -w 5",
                "iptables -t mangle -D PREROUTING 1 -w 5",
                "iptables -t mangle -L PREROUTING -v -n --line-numbers -w 5",
                "iptables -t mangle -L OUTPUT -v -n --line-numbers -w 5",
            ]
        );
    }

    #[test]
    fn test_disable_gives_up_eventually() {
        // the listing never changes, as if another process kept re-adding rules
        let runner = Arc::new(
            RecordingRunner::new().with_output("iptables -t mangle -L PREROUTING", LISTING),
        );
        let routing = AllowlistRouting::new(runner.clone(), vec![IPV4_TABLE.to_string()], 5);

        match routing.disable() {
            Err(Error::CleanupLimit { chain, attempts }) => {
                assert_eq!(chain, "PREROUTING");
                assert_eq!(attempts, MAX_CLEANUP_PASSES);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        let deletes = runner.commands().iter().filter(|c| c.contains(" -D ")).count();
        assert_eq!(deletes, 2 * MAX_CLEANUP_PASSES);
    }
}
