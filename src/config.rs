use crate::utils::get_config_dir;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "firewall.json";

/// Runtime parameters of the iptables backend and the firewall service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Match module used for connection tracking (`-m <module>`)
    #[serde(default = "default_state_module")]
    pub state_module: String,
    /// Flag introducing the state list, e.g. `--ctstate`
    #[serde(default = "default_state_flag")]
    pub state_flag: String,
    /// Prepended to every built-in chain name
    #[serde(default)]
    pub chain_prefix: String,
    /// Candidate binaries, filtered against the system at start-up
    #[serde(default = "default_tables")]
    pub tables: Vec<String>,
    /// Seconds each invocation waits for the xtables lock (`-w`)
    #[serde(default = "default_lock_wait")]
    pub lock_wait_secs: u64,
    /// Packet mark applied to allowlisted traffic
    #[serde(default = "default_allowlist_mark")]
    pub allowlist_mark: u32,
    /// Whether the firewall starts enforcing
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            state_module: default_state_module(),
            state_flag: default_state_flag(),
            chain_prefix: String::new(),
            tables: default_tables(),
            lock_wait_secs: default_lock_wait(),
            allowlist_mark: default_allowlist_mark(),
            enabled: true,
        }
    }
}

fn default_state_module() -> String {
    "conntrack".to_string()
}

fn default_state_flag() -> String {
    "--ctstate".to_string()
}

fn default_tables() -> Vec<String> {
    vec![
        crate::core::iptables::IPV4_TABLE.to_string(),
        crate::core::iptables::IPV6_TABLE.to_string(),
    ]
}

fn default_lock_wait() -> u64 {
    5
}

fn default_allowlist_mark() -> u32 {
    0xe1f1
}

fn default_true() -> bool {
    true
}

/// Default location of the configuration file
pub fn config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join(CONFIG_FILE))
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file in the target directory.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
///
/// # Errors
///
/// Returns `Err` if serialization or any filesystem step fails.
pub fn save_config_to(path: &Path, config: &FirewallConfig) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut file = tempfile::NamedTempFile::new_in(dir)?;

    // Restrict before any data is written
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(json.as_bytes())?;
    file.as_file().sync_all()?;

    file.persist(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e.error
        }
    })?;
    Ok(())
}

/// Loads the config from `path`, or returns the default if missing or unreadable.
pub fn load_config_from(path: &Path) -> FirewallConfig {
    match std::fs::read_to_string(path) {
        Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            tracing::warn!("Ignoring invalid config {}: {e}", path.display());
            FirewallConfig::default()
        }),
        Err(_) => FirewallConfig::default(),
    }
}

/// Saves the config to the default location, creating the directory if needed.
///
/// # Errors
///
/// Returns `Err` if the directory cannot be created or the write fails.
pub fn save_config(config: &FirewallConfig) -> std::io::Result<()> {
    if let Some(dir) = crate::utils::ensure_config_dir()? {
        save_config_to(&dir.join(CONFIG_FILE), config)?;
    }
    Ok(())
}

/// Loads the config from the default location.
pub fn load_config() -> FirewallConfig {
    config_path().map_or_else(FirewallConfig::default, |path| load_config_from(&path))
}
