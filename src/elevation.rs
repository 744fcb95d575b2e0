//! Privilege elevation for netfilter commands
//!
//! The VPN daemon runs as root and executes `iptables` directly. An
//! unprivileged caller is refused unless an escalation method is requested
//! explicitly (development builds, tests against a real kernel); the engine
//! never prompts for credentials on its own.
//!
//! # Elevation Strategy
//!
//! 1. `VPNFW_TEST_NO_ELEVATION` set: run the program directly
//! 2. Running as root: run the program directly
//! 3. `VPNFW_ELEVATION_METHOD` set: use exactly that method (`sudo`, `run0`, `pkexec`)
//! 4. Otherwise fail with [`ElevationError::NotRoot`]
//!
//! # Environment Variables
//!
//! - `VPNFW_ELEVATION_METHOD`: force a specific elevation method
//! - `VPNFW_TEST_NO_ELEVATION`: bypass elevation entirely (for testing only)
//! - `VPNFW_IPTABLES_DIR`: directory the netfilter binaries are resolved from
//!   instead of `PATH` (used to point tests at mock scripts)
//!
//! # Security
//!
//! - Only `iptables`, `ip6tables` and `ip` can be elevated
//! - Commands are constructed without shell interpolation

use std::io;
use std::path::PathBuf;
use std::process::Command;

/// Programs the engine is allowed to run
const ALLOWED_PROGRAMS: [&str; 3] = ["iptables", "ip6tables", "ip"];

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Program is not one of the netfilter tools this crate runs
    #[error("Program '{0}' is not allowed to be elevated")]
    ProgramNotAllowed(String),

    /// Not running as root and no elevation method requested
    #[error("{0} requires root privileges (set VPNFW_ELEVATION_METHOD to escalate)")]
    NotRoot(String),

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `VPNFW_ELEVATION_METHOD`
    #[error("Invalid VPNFW_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Resolves the program path, honouring `VPNFW_IPTABLES_DIR`
fn resolve_program(program: &str) -> PathBuf {
    match std::env::var_os("VPNFW_IPTABLES_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join(program),
        _ => PathBuf::from(program),
    }
}

fn elevated_with(method: &str, program: &PathBuf, args: &[&str]) -> Command {
    let mut cmd = Command::new(method);
    cmd.arg(program).args(args);
    cmd
}

fn direct(program: &PathBuf, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

/// Creates a command running `program` with root privileges
///
/// Arguments are passed directly without shell interpretation. Callers must
/// validate them before calling this function.
///
/// # Errors
///
/// Returns `Err` if the program is not allowed, the caller is not root and
/// requested no elevation method, or the requested method is unavailable.
pub fn create_elevated_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    if !ALLOWED_PROGRAMS.contains(&program) {
        return Err(ElevationError::ProgramNotAllowed(program.to_string()));
    }
    let path = resolve_program(program);

    if std::env::var("VPNFW_TEST_NO_ELEVATION").is_ok() {
        return Ok(direct(&path, args));
    }

    if nix::unistd::getuid().is_root() {
        return Ok(direct(&path, args));
    }

    if let Ok(method) = std::env::var("VPNFW_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if !binary_exists(&method) {
                        return Err(ElevationError::MethodNotAvailable(method));
                    }
                    Ok(elevated_with(&method, &path, args))
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    Err(ElevationError::NotRoot(program.to_string()))
}
