//! Execution of external firewall programs
//!
//! Everything that touches the kernel goes through a [`CommandRunner`]. The
//! core hands it a program name and a fully-formed argument list; nothing is
//! ever passed through a shell.

use crate::core::error::{Error, Result};
use tracing::{debug, error};

/// Runs an external program and returns its combined stdout and stderr
pub trait CommandRunner: Send + Sync {
    /// # Errors
    ///
    /// Returns `Error::Execution` with the captured output if the program
    /// exits with a non-zero status, `Error::Spawn` if it cannot be started.
    fn run(&self, program: &str, args: &[String]) -> Result<Vec<u8>>;
}

/// Production [`CommandRunner`] spawning real processes
///
/// The process is built by [`crate::elevation::create_elevated_command`], so
/// an unprivileged caller is escalated the same way for every invocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let mut cmd = crate::elevation::create_elevated_command(program, &arg_refs)?;

        debug!("Running {} {}", program, args.join(" "));
        let output = cmd.output().map_err(|source| {
            error!("Failed to spawn {program}: {source}");
            Error::Spawn {
                program: program.to_string(),
                source,
            }
        })?;

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);

        if output.status.success() {
            Ok(combined)
        } else {
            Err(Error::Execution {
                program: program.to_string(),
                args: args.join(" "),
                output: String::from_utf8_lossy(&combined).trim().to_string(),
                exit_code: output.status.code(),
            })
        }
    }
}

/// Converts a list of string slices into an owned argument list
pub fn to_args<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    args.into_iter().map(Into::into).collect()
}
