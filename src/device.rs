//! Network device discovery
//!
//! Rules that should apply to "the physical uplink" are written without
//! interfaces and bound to the devices reported by a [`DeviceLister`] right
//! before they are added.

use crate::command::{CommandRunner, to_args};
use crate::core::error::{Error, Result};
use crate::core::rule::{Interface, Rule};
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Kernel directory holding one entry per virtual network device
const VIRTUAL_NET_DIR: &str = "/sys/devices/virtual/net";

/// Source of the interfaces rules are bound to
pub trait DeviceLister: Send + Sync {
    fn list(&self) -> Result<Vec<Interface>>;
}

/// Lists the physical network interfaces of this host
///
/// Containers only see virtual devices. When every interface is virtual, the
/// interfaces carrying the IPv4 and IPv6 default routes are used instead.
pub struct PhysicalDevices {
    runner: Arc<dyn CommandRunner>,
    virtual_dir: PathBuf,
}

impl PhysicalDevices {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            virtual_dir: PathBuf::from(VIRTUAL_NET_DIR),
        }
    }

    fn system_interfaces() -> Result<Vec<String>> {
        let interfaces = NetworkInterface::show()
            .map_err(|e| Error::Devices(format!("retrieving system network interfaces: {e}")))?;
        // one entry per address, not per device
        let mut names: Vec<String> = Vec::new();
        for iface in interfaces {
            if !names.contains(&iface.name) {
                names.push(iface.name);
            }
        }
        Ok(names)
    }

    fn virtual_interfaces(&self) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.virtual_dir).map_err(|e| {
            Error::Devices(format!("listing {}: {e}", self.virtual_dir.display()))
        })?;
        Ok(entries
            .flatten()
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect())
    }

    /// Interface used by the default route of the given family
    pub fn default_gateway(&self, ipv6: bool) -> Result<String> {
        let version = if ipv6 { "-6" } else { "-4" };
        let out = self
            .runner
            .run("ip", &to_args([version, "route", "list", "default"]))?;
        let out = String::from_utf8_lossy(&out);
        let first = out
            .lines()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| Error::Devices("default gateway does not exist".to_string()))?;
        interface_name_from_ip_route(first)
            .map(str::to_string)
            .ok_or_else(|| Error::Devices(format!("malformed route: {first}")))
    }
}

impl DeviceLister for PhysicalDevices {
    fn list(&self) -> Result<Vec<Interface>> {
        let all = Self::system_interfaces()?;
        let virtual_names = self.virtual_interfaces()?;
        select_physical(&all, &virtual_names, |ipv6| self.default_gateway(ipv6))
    }
}

/// Picks the physical interfaces out of `all`, falling back to the default
/// gateway interfaces when every interface is virtual.
fn select_physical(
    all: &[String],
    virtual_names: &[String],
    gateway: impl Fn(bool) -> Result<String>,
) -> Result<Vec<Interface>> {
    let physical: Vec<Interface> = all
        .iter()
        .filter(|name| !virtual_names.contains(name))
        .map(Interface::new)
        .collect();
    if !physical.is_empty() {
        return Ok(physical);
    }

    debug!("No physical interfaces, falling back to default gateway");
    match (gateway(false), gateway(true)) {
        (Ok(v4), Ok(v6)) if v4 != v6 => Ok(vec![Interface::new(v4), Interface::new(v6)]),
        (Ok(v4), _) => Ok(vec![Interface::new(v4)]),
        (Err(_), Ok(v6)) => Ok(vec![Interface::new(v6)]),
        (Err(e), Err(_)) => Err(e),
    }
}

/// Name of the device in a line of `ip route` output (the word after `dev`)
fn interface_name_from_ip_route(line: &str) -> Option<&str> {
    let mut words = line.split_whitespace();
    words.find(|&word| word == "dev")?;
    words.next()
}

/// Binds a rule without interfaces to the devices reported by `lister`.
///
/// Rules with explicit interfaces are returned unchanged.
pub fn bind_to_devices(mut rule: Rule, lister: &dyn DeviceLister) -> Result<Rule> {
    if rule.interfaces.is_empty() {
        rule.interfaces = lister.list()?;
    }
    Ok(rule)
}
