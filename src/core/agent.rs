//! Pluggable firewall backends
//!
//! An [`Agent`] realizes or retracts one [`Rule`] at a time. The firewall
//! keeps two of them: the real backend and [`NoopAgent`], which is active
//! while enforcement is administratively disabled.

use crate::core::error::Result;
use crate::core::rule::Rule;

/// Backend capable of applying a single rule to the system
///
/// Implementations take `&self` and must do their own locking, since the
/// same backend can be reached from several places at once.
pub trait Agent: Send + Sync {
    fn add(&self, rule: &Rule) -> Result<()>;
    fn delete(&self, rule: &Rule) -> Result<()>;
    /// Removes every rule this program owns, regardless of bookkeeping
    fn flush(&self) -> Result<()>;
}

/// Backend that accepts everything and touches nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAgent;

impl Agent for NoopAgent {
    fn add(&self, _rule: &Rule) -> Result<()> {
        Ok(())
    }

    fn delete(&self, _rule: &Rule) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
