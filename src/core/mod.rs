//! Core firewall policy engine
//!
//! This module contains the rule model and everything that turns rules into
//! netfilter state. It provides:
//!
//! - [`rule`]: Declarative firewall rules
//! - [`registry`]: Ordered in-memory record of active rules
//! - [`agent`]: Backend abstraction and the no-op backend
//! - [`iptables`]: Rule compiler and iptables/ip6tables backend
//! - [`firewall`]: Orchestrator switching between backends
//! - [`allowlist`]: Mark-based routing of allowlisted traffic
//! - [`error`]: Error types for firewall operations

pub mod agent;
pub mod allowlist;
pub mod error;
pub mod firewall;
pub mod iptables;
pub mod registry;
pub mod rule;

#[cfg(test)]
pub mod test_helpers;
