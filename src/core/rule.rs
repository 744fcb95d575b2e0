//! Declarative firewall rule model
//!
//! A [`Rule`] describes one policy intent: which interfaces, networks, ports,
//! protocols and connection states it applies to, in which direction, and
//! whether matching packets are accepted or dropped. Rules carry no backend
//! specific data, the same value is handed to every [`Agent`](crate::core::agent::Agent).
//!
//! Every collection field may be left empty. An empty collection means "any"
//! and never means "nothing": the compiler turns it into a single wildcard
//! element, so at least one concrete rule is always generated.
//!
//! # Example
//!
//! ```
//! use vpnfw::core::rule::{Direction, Interface, Rule};
//!
//! let rule = Rule {
//!     name: "block_lan".to_string(),
//!     interfaces: vec![Interface::new("eth0")],
//!     remote_networks: vec!["192.168.0.0/16".parse().unwrap()],
//!     direction: Direction::TwoWay,
//!     ..Rule::default()
//! };
//! assert!(!rule.allow);
//! ```

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Network interface a rule is bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
}

impl Interface {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Which side of a flow the rule's ports are matched on
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
pub enum PortsDirection {
    /// Match either source or destination port (one rule per side)
    #[default]
    #[strum(serialize = "source_and_destination")]
    SourceAndDestination,
    #[strum(serialize = "destination")]
    Destination,
    #[strum(serialize = "source")]
    Source,
}

/// Direction of the packets a rule applies to
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Incoming packets
    #[default]
    #[strum(serialize = "inbound")]
    Inbound,
    /// Outgoing packets
    #[strum(serialize = "outbound")]
    Outbound,
    /// Both incoming and outgoing packets
    #[strum(serialize = "two_way")]
    TwoWay,
    /// Packets routed through this host
    #[strum(serialize = "forward")]
    Forward,
}

/// Connection tracking state of a packet
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Packet is associated with a known connection
    #[strum(serialize = "ESTABLISHED")]
    Established,
    /// Packet starts a new connection related to an existing one
    #[strum(serialize = "RELATED")]
    Related,
    /// Packet starts a new connection
    #[strum(serialize = "NEW")]
    New,
}

/// Connection tracking constraint of a rule
///
/// An empty `states` list disables connection tracking matching entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStates {
    #[serde(default)]
    pub states: Vec<ConnectionState>,
    /// Original source address of the tracked connection (`--ctorigsrc`)
    #[serde(default)]
    pub src_addr: Option<IpAddr>,
}

impl ConnectionStates {
    pub fn new(states: Vec<ConnectionState>) -> Self {
        Self {
            states,
            src_addr: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// A single declarative firewall rule
///
/// Two rules are equal when every field is equal; the firewall uses this to
/// tell a duplicate submission from a replacement of a rule with the same name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique key of the rule
    pub name: String,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub remote_networks: Vec<IpNetwork>,
    #[serde(default)]
    pub local_networks: Vec<IpNetwork>,
    /// Ports grouped into ranges before compilation; 0 stands for "no port"
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub ports_direction: PortsDirection,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub direction: Direction,
    /// Attach to PREROUTING/POSTROUTING in the mangle table instead of
    /// INPUT/OUTPUT in the filter table
    #[serde(default)]
    pub physical: bool,
    #[serde(default)]
    pub connection_states: ConnectionStates,
    /// Packets carrying any of these marks are affected; 0 means unmarked
    #[serde(default)]
    pub marks: Vec<u32>,
    /// Accept matching packets instead of dropping them
    #[serde(default)]
    pub allow: bool,
    #[serde(default)]
    pub ipv6_only: bool,
    #[serde(default)]
    pub icmpv6_types: Vec<u8>,
    #[serde(default)]
    pub hop_limit: Option<u8>,
    /// Raw source ports, used only when `ports` is empty
    #[serde(default)]
    pub source_ports: Vec<u16>,
    /// Raw destination ports, used only when `ports` is empty
    #[serde(default)]
    pub destination_ports: Vec<u16>,
    /// Ownership tag; the default marker is used when absent
    #[serde(default)]
    pub comment: Option<String>,
}

impl Rule {
    /// Creates an empty rule with the given name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}
