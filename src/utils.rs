//! Utility functions for directory management
//!
//! Follows the XDG Base Directory specification:
//!
//! - Config: `~/.config/vpnfw/` - `FirewallConfig` (`firewall.json`)
//!
//! The daemon usually runs as root, in which case this resolves under `/root`.

use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "vpnfw", "vpnfw")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

/// Creates the configuration directory with user-only permissions
pub fn ensure_config_dir() -> std::io::Result<Option<PathBuf>> {
    let Some(dir) = get_config_dir() else {
        return Ok(None);
    };

    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        DirBuilder::new().mode(0o700).recursive(true).create(&dir)?;
    }

    #[cfg(not(unix))]
    std::fs::create_dir_all(&dir)?;

    Ok(Some(dir))
}

/// Formats a mark the way iptables prints it (`0x` prefixed hex)
pub fn format_mark(mark: u32) -> String {
    format!("{mark:#x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mark() {
        assert_eq!(format_mark(0xe1f1), "0xe1f1");
        assert_eq!(format_mark(0x123), "0x123");
        assert_eq!(format_mark(0xffff_ffff), "0xffffffff");
    }

    #[test]
    fn test_config_dir_is_project_scoped() {
        if let Some(dir) = get_config_dir() {
            assert!(dir.to_string_lossy().contains("vpnfw"));
        }
    }
}
