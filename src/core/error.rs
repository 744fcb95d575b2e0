use thiserror::Error;

/// Core error types for the firewall engine
#[derive(Debug, Error)]
pub enum Error {
    /// No rule with the requested name is registered
    #[error("rule not found")]
    RuleNotFound,

    /// A rule with the same name (and identical content) is already registered
    #[error("rule already exists")]
    RuleAlreadyExists,

    /// Rules are keyed by name, an empty one cannot be stored
    #[error("rule without name")]
    RuleWithoutName,

    #[error("firewall is already enabled")]
    FirewallAlreadyEnabled,

    #[error("firewall is already disabled")]
    FirewallAlreadyDisabled,

    /// External command exited with a non-zero status
    #[error("{program} {args} failed: {output}")]
    Execution {
        program: String,
        args: String,
        output: String,
        exit_code: Option<i32>,
    },

    /// External command could not be started at all
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Network interface discovery failed
    #[error("listing network interfaces: {0}")]
    Devices(String),

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Some owned rules could not be removed during a flush
    #[error("failed to delete {failed} rule(s) while flushing")]
    FlushIncomplete { failed: usize },

    /// Allowlist cleanup did not converge
    #[error("allowlist cleanup of {chain} did not finish after {attempts} deletions")]
    CleanupLimit { chain: String, attempts: usize },

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Marks an error as produced by the firewall orchestrator
    #[error("firewall: {0}")]
    Internal(#[source] Box<Error>),
}

impl Error {
    /// Wraps an error as a firewall error. Already wrapped errors are left as is.
    pub fn internal(err: Error) -> Self {
        match err {
            Error::Internal(_) => err,
            other => Error::Internal(Box::new(other)),
        }
    }

    /// Returns the innermost error, skipping any `Internal` wrappers.
    pub fn cause(&self) -> &Error {
        let mut current = self;
        while let Error::Internal(inner) = current {
            current = inner;
        }
        current
    }

    /// Translation of a failed external command, if this is one
    pub fn translation(&self) -> Option<ErrorTranslation> {
        match self.cause() {
            Error::Execution { output, .. } => Some(IptablesErrorPattern::match_error(output)),
            _ => None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Output printed by `iptables -D` when the rule to delete is not present.
    const MISSING_RULE: &'static str = "does a matching rule exist in that chain";

    /// Reports whether a failed delete only means the rule was already gone.
    pub fn is_missing_rule(output: &str) -> bool {
        output.contains(Self::MISSING_RULE)
    }

    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if Self::is_missing_rule(msg) || lower.contains("no chain/target/match by that name") {
            return ErrorTranslation::new("Firewall rule does not exist")
                .with_suggestion("The rule may have been removed by another program")
                .with_suggestion("Inspect current rules: iptables -S");
        }

        if lower.contains("permission denied") || lower.contains("you must be root") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run the daemon as root or grant CAP_NET_ADMIN")
                .with_suggestion("Set VPNFW_ELEVATION_METHOD to sudo, run0 or pkexec");
        }

        if lower.contains("xtables lock") {
            return ErrorTranslation::new("Another program is holding the xtables lock")
                .with_suggestion("Another firewall manager may be applying rules")
                .with_suggestion("Increase lock_wait_secs in the configuration");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables  (Fedora/RHEL)")
                .with_suggestion("Or: sudo pacman -S iptables  (Arch)");
        }

        if lower.contains("couldn't load") || lower.contains("can't initialize") {
            return ErrorTranslation::new("Kernel is missing a required netfilter module")
                .with_suggestion("Check loaded modules: lsmod | grep -E 'xt_|nf_conntrack'")
                .with_suggestion("Load conntrack support: sudo modprobe nf_conntrack");
        }

        if lower.contains("bad argument") || lower.contains("invalid") || lower.contains("unknown option") {
            return ErrorTranslation::new("Invalid firewall rule syntax")
                .with_suggestion("Verify port numbers are between 1 and 65535")
                .with_suggestion("Ensure IP addresses and network masks are valid");
        }

        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables is working: sudo iptables -S")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
