//! vpnfw - VPN client firewall policy engine
//!
//! Turns declarative allow/block rules into iptables and ip6tables rules,
//! keeps the authoritative record of active policy and switches enforcement
//! on and off without losing it.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, rule compiler, backends and the firewall service
//! - [`command`] - Execution of external programs
//! - [`elevation`] - Privilege escalation for netfilter commands
//! - [`device`] - Physical network interface discovery
//! - [`validators`] - Input validation for rule fields
//! - [`config`] - Configuration persistence
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vpnfw::command::SystemCommandRunner;
//! use vpnfw::config::load_config;
//! use vpnfw::core::agent::NoopAgent;
//! use vpnfw::core::firewall::Firewall;
//! use vpnfw::core::iptables::IPTables;
//! use vpnfw::core::rule::{Direction, Rule};
//!
//! let config = load_config();
//! let iptables = IPTables::from_config(Arc::new(SystemCommandRunner), &config);
//! let firewall = Firewall::new(Arc::new(NoopAgent), Arc::new(iptables), config.enabled);
//!
//! // remove rules left behind by a previous run
//! firewall.flush()?;
//! firewall.add(vec![Rule {
//!     direction: Direction::TwoWay,
//!     ..Rule::named("block_all")
//! }])?;
//! # Ok::<(), vpnfw::Error>(())
//! ```

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod command;
pub mod config;
pub mod core;
pub mod device;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::firewall::Firewall;
pub use core::rule::Rule;
