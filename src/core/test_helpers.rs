//! Shared test utilities for core module tests
//!
//! Provides mock runners and agents so tests never touch the real netfilter
//! ruleset or require elevation. This module is only compiled in test mode.

use crate::command::CommandRunner;
use crate::core::agent::Agent;
use crate::core::error::{Error, Result};
use crate::core::rule::Rule;
use std::sync::{Mutex, Once, PoisonError};

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("VPNFW_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("VPNFW_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

static TRACING_INIT: Once = Once::new();

/// Routes `tracing` output to the test harness (shown for failing tests only)
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// Output iptables prints when `-D` finds nothing to delete
pub const MISSING_RULE_OUTPUT: &str =
    "iptables: Bad rule (does a matching rule exist in that chain?).";

/// [`CommandRunner`] that records every invocation instead of running it.
///
/// Invocations are recorded as `"<program> <args...>"`. Behaviour is chosen
/// by substring matches on that line.
#[derive(Default)]
pub struct RecordingRunner {
    commands: Mutex<Vec<String>>,
    failures: Vec<String>,
    missing_rules: Vec<String>,
    outputs: Mutex<Vec<CannedOutput>>,
}

struct CannedOutput {
    prefix: String,
    output: String,
    once: bool,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails invocations containing `pattern` with a generic error
    pub fn fail_on(mut self, pattern: &str) -> Self {
        self.failures.push(pattern.to_string());
        self
    }

    /// Fails invocations containing `pattern` with iptables' "no such rule" output
    pub fn missing_rule_on(mut self, pattern: &str) -> Self {
        self.missing_rules.push(pattern.to_string());
        self
    }

    /// Returns `output` for invocations starting with `prefix`
    pub fn with_output(self, prefix: &str, output: &str) -> Self {
        self.canned(prefix, output, false)
    }

    /// Like [`Self::with_output`], but only for the first matching invocation
    pub fn with_output_once(self, prefix: &str, output: &str) -> Self {
        self.canned(prefix, output, true)
    }

    fn canned(self, prefix: &str, output: &str, once: bool) -> Self {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CannedOutput {
                prefix: prefix.to_string(),
                output: output.to_string(),
                once,
            });
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        let line = format!("{program} {}", args.join(" "));
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.clone());

        let failure = |output: &str| Error::Execution {
            program: program.to_string(),
            args: args.join(" "),
            output: output.to_string(),
            exit_code: Some(1),
        };
        if self.missing_rules.iter().any(|p| line.contains(p.as_str())) {
            return Err(failure(MISSING_RULE_OUTPUT));
        }
        if self.failures.iter().any(|p| line.contains(p.as_str())) {
            return Err(failure("iptables: Permission denied (you must be root)."));
        }
        let mut outputs = self.outputs.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(pos) = outputs
            .iter()
            .position(|canned| line.starts_with(canned.prefix.as_str()))
        else {
            return Ok(Vec::new());
        };
        let output = outputs[pos].output.clone().into_bytes();
        if outputs[pos].once {
            outputs.remove(pos);
        }
        Ok(output)
    }
}

/// [`Agent`] that records calls as `"add:<name>"` / `"delete:<name>"`
#[derive(Default)]
pub struct CountingAgent {
    calls: Mutex<Vec<String>>,
    fail_on: Option<String>,
}

impl CountingAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every call for the rule with this name
    pub fn failing_on(name: &str) -> Self {
        Self {
            calls: Mutex::default(),
            fail_on: Some(name.to_string()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn adds(&self) -> usize {
        self.calls().iter().filter(|c| c.starts_with("add:")).count()
    }

    pub fn deletes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with("delete:"))
            .count()
    }

    fn record(&self, op: &str, rule: &Rule) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{op}:{}", rule.name));
        if self.fail_on.as_deref() == Some(rule.name.as_str()) {
            return Err(Error::Execution {
                program: "mock".to_string(),
                args: format!("{op} {}", rule.name),
                output: "mock failure".to_string(),
                exit_code: Some(1),
            });
        }
        Ok(())
    }
}

impl Agent for CountingAgent {
    fn add(&self, rule: &Rule) -> Result<()> {
        self.record("add", rule)
    }

    fn delete(&self, rule: &Rule) -> Result<()> {
        self.record("delete", rule)
    }

    fn flush(&self) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push("flush".to_string());
        Ok(())
    }
}
