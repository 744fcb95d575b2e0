//! Firewall service
//!
//! [`Firewall`] owns the authoritative rule registry and decides which backend
//! rules are applied to. While enabled every change goes to the working
//! backend (normally [`IPTables`](crate::core::iptables::IPTables)); while
//! disabled it goes to [`NoopAgent`](crate::core::agent::NoopAgent), so the
//! registry still reflects what would be enforced.
//!
//! Enabling or disabling replays the whole registry, in insertion order, from
//! one backend to the other.
//!
//! Failures are not rolled back. The registry is only changed after the
//! backend accepted the rule, and rules left behind in the kernel by a partial
//! failure are removed by [`Firewall::flush`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use vpnfw::core::agent::NoopAgent;
//! use vpnfw::core::firewall::Firewall;
//! use vpnfw::core::rule::Rule;
//!
//! let firewall = Firewall::new(Arc::new(NoopAgent), Arc::new(NoopAgent), false);
//! firewall.add(vec![Rule::named("block_lan")]).unwrap();
//! firewall.enable().unwrap();
//! assert!(firewall.is_enabled());
//! ```

use crate::core::agent::Agent;
use crate::core::error::{Error, Result};
use crate::core::registry::OrderedRules;
use crate::core::rule::Rule;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

struct FirewallState {
    rules: OrderedRules,
    current: Arc<dyn Agent>,
    enabled: bool,
}

/// Orchestrates rule changes and enforcement state
pub struct Firewall {
    noop: Arc<dyn Agent>,
    working: Arc<dyn Agent>,
    state: Mutex<FirewallState>,
}

impl Firewall {
    pub fn new(noop: Arc<dyn Agent>, working: Arc<dyn Agent>, enabled: bool) -> Self {
        let current = if enabled {
            Arc::clone(&working)
        } else {
            Arc::clone(&noop)
        };
        Self {
            noop,
            working,
            state: Mutex::new(FirewallState {
                rules: OrderedRules::new(),
                current,
                enabled,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FirewallState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds rules, replacing stored rules of the same name.
    ///
    /// Processing stops at the first failure; rules handled before it stay
    /// applied.
    ///
    /// # Errors
    ///
    /// - `RuleWithoutName` for a rule with an empty name
    /// - `RuleAlreadyExists` if an identical rule is stored
    /// - `Validation` for a rule the working backend cannot express, even
    ///   while disabled
    /// - any backend error
    pub fn add(&self, rules: impl IntoIterator<Item = Rule>) -> Result<()> {
        let mut state = self.lock();
        for rule in rules {
            Self::add_rule(&mut state, rule).map_err(Error::internal)?;
        }
        Ok(())
    }

    fn add_rule(state: &mut FirewallState, rule: Rule) -> Result<()> {
        if rule.name.is_empty() {
            return Err(Error::RuleWithoutName);
        }
        // the noop backend accepts anything, so a disabled firewall must
        // reject what the working backend would
        crate::validators::validate_rule(&rule)?;

        match state.rules.get(&rule.name) {
            Ok(existing) if existing == rule => Err(Error::RuleAlreadyExists),
            Ok(existing) => {
                debug!("Replacing firewall rule {}", rule.name);
                // new rule goes in before the old one is removed
                state.current.add(&rule)?;
                state.rules.delete(&existing.name)?;
                state.rules.add(rule)?;
                state.current.delete(&existing)
            }
            Err(_) => {
                state.current.add(&rule)?;
                state.rules.add(rule)
            }
        }
    }

    /// Deletes rules by name.
    ///
    /// # Errors
    ///
    /// `RuleNotFound` for an unknown name, or any backend error. Processing
    /// stops at the first failure.
    pub fn delete<I, S>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.lock();
        for name in names {
            let name = name.as_ref();
            let rule = state.rules.get(name).map_err(Error::internal)?;
            state.current.delete(&rule).map_err(Error::internal)?;
            state.rules.delete(name).map_err(Error::internal)?;
        }
        Ok(())
    }

    /// Starts enforcing: moves every stored rule to the working backend.
    ///
    /// # Errors
    ///
    /// `FirewallAlreadyEnabled`, or the first backend error of the swap, in
    /// which case the firewall stays disabled.
    pub fn enable(&self) -> Result<()> {
        let mut state = self.lock();
        if state.enabled {
            return Err(Error::internal(Error::FirewallAlreadyEnabled));
        }
        Self::swap(&state.rules, self.noop.as_ref(), self.working.as_ref())
            .map_err(Error::internal)?;
        state.current = Arc::clone(&self.working);
        state.enabled = true;
        info!("Firewall enabled with {} rule(s)", state.rules.len());
        Ok(())
    }

    /// Stops enforcing: moves every stored rule to the noop backend.
    ///
    /// # Errors
    ///
    /// `FirewallAlreadyDisabled`, or the first backend error of the swap, in
    /// which case the firewall stays enabled.
    pub fn disable(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.enabled {
            return Err(Error::internal(Error::FirewallAlreadyDisabled));
        }
        Self::swap(&state.rules, self.working.as_ref(), self.noop.as_ref())
            .map_err(Error::internal)?;
        state.current = Arc::clone(&self.noop);
        state.enabled = false;
        info!("Firewall disabled");
        Ok(())
    }

    /// Replays every rule in stored order, deleting it from `from` and adding it to `to`.
    fn swap(rules: &OrderedRules, from: &dyn Agent, to: &dyn Agent) -> Result<()> {
        for rule in rules.iter() {
            from.delete(rule)?;
            to.add(rule)?;
        }
        Ok(())
    }

    /// Removes every rule the working backend owns, whether registered or not.
    ///
    /// The registry is left untouched; this is meant for start-up cleanup of
    /// rules left by a previous process.
    pub fn flush(&self) -> Result<()> {
        let _state = self.lock();
        self.working.flush().map_err(Error::internal)
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Copies of the stored rules in insertion order
    pub fn rules(&self) -> Vec<Rule> {
        self.lock().rules.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent::NoopAgent;
    use crate::core::rule::{Direction, Interface};
    use crate::core::test_helpers::CountingAgent;

    fn firewall(working: &Arc<CountingAgent>, enabled: bool) -> Firewall {
        Firewall::new(Arc::new(NoopAgent), working.clone(), enabled)
    }

    fn names(fw: &Firewall) -> Vec<String> {
        fw.rules().into_iter().map(|r| r.name).collect()
    }

    #[test]
    fn test_add_rule_without_name() {
        let fw = Firewall::new(Arc::new(NoopAgent), Arc::new(NoopAgent), true);
        let err = fw.add(vec![Rule::default()]).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(matches!(err.cause(), Error::RuleWithoutName));
    }

    #[test]
    fn test_add_identical_rule_twice() {
        let working = Arc::new(CountingAgent::new());
        let fw = firewall(&working, true);

        fw.add(vec![Rule::named("block")]).unwrap();
        let err = fw.add(vec![Rule::named("block")]).unwrap_err();
        assert!(matches!(err.cause(), Error::RuleAlreadyExists));
        assert_eq!(working.calls(), vec!["add:block"]);
    }

    #[test]
    fn test_replace_rule() {
        let working = Arc::new(CountingAgent::new());
        let fw = firewall(&working, true);

        let lo = Rule {
            interfaces: vec![Interface::new("lo0")],
            ..Rule::named("block")
        };
        let en = Rule {
            interfaces: vec![Interface::new("en0")],
            ..Rule::named("block")
        };
        fw.add(vec![lo, Rule::named("other")]).unwrap();
        fw.add(vec![en.clone()]).unwrap();

        assert_eq!(fw.rules().iter().filter(|r| r.name == "block").count(), 1);
        assert_eq!(fw.rules().last(), Some(&en));
        assert_eq!(names(&fw), vec!["other", "block"]);
        // add-before-delete
        assert_eq!(
            working.calls(),
            vec!["add:block", "add:other", "add:block", "delete:block"]
        );
    }

    #[test]
    fn test_disabled_firewall_rejects_invalid_rule() {
        let working = Arc::new(CountingAgent::new());
        let fw = firewall(&working, false);

        let bad = Rule {
            interfaces: vec![Interface::new("-j ACCEPT")],
            ..Rule::named("bad")
        };
        let err = fw.add(vec![Rule::named("good"), bad]).unwrap_err();
        assert!(matches!(err.cause(), Error::Validation { .. }));
        assert_eq!(names(&fw), vec!["good"]);

        // nothing stored can fail validation on enable
        fw.enable().unwrap();
        assert!(fw.is_enabled());
        assert_eq!(working.calls(), vec!["add:good"]);
    }

    #[test]
    fn test_add_stops_at_first_failure() {
        let working = Arc::new(CountingAgent::failing_on("second"));
        let fw = firewall(&working, true);

        let result = fw.add(vec![
            Rule::named("first"),
            Rule::named("second"),
            Rule::named("third"),
        ]);
        assert!(matches!(
            result.unwrap_err().cause(),
            Error::Execution { .. }
        ));
        assert_eq!(names(&fw), vec!["first"]);
        assert_eq!(working.calls(), vec!["add:first", "add:second"]);
    }

    #[test]
    fn test_delete() {
        let working = Arc::new(CountingAgent::new());
        let fw = firewall(&working, true);

        let err = fw.delete(["missing"]).unwrap_err();
        assert!(matches!(err.cause(), Error::RuleNotFound));

        fw.add(vec![Rule::named("a"), Rule::named("b"), Rule::named("c")])
            .unwrap();
        fw.delete(["b"]).unwrap();
        assert_eq!(names(&fw), vec!["a", "c"]);
        assert_eq!(working.deletes(), 1);
    }

    #[test]
    fn test_failed_enable_stays_disabled() {
        let working = Arc::new(CountingAgent::failing_on("a"));
        let fw = firewall(&working, false);
        fw.add(vec![Rule::named("a")]).unwrap();

        // disabled: the failing backend is not involved
        fw.delete(["a"]).unwrap();
        assert!(working.calls().is_empty());

        fw.add(vec![Rule::named("a")]).unwrap();
        assert!(fw.enable().is_err());
        assert!(!fw.is_enabled());
        assert_eq!(names(&fw), vec!["a"]);
    }

    #[test]
    fn test_disabled_firewall_uses_noop() {
        let working = Arc::new(CountingAgent::new());
        let fw = firewall(&working, false);

        fw.add(vec![Rule::named("block")]).unwrap();
        fw.delete(["block"]).unwrap();
        assert!(working.calls().is_empty());
    }

    #[test]
    fn test_enable_disable_toggling() {
        let working = Arc::new(CountingAgent::new());
        let fw = firewall(&working, false);
        assert!(!fw.is_enabled());

        fw.enable().unwrap();
        assert!(fw.is_enabled());
        assert!(matches!(
            fw.enable().unwrap_err().cause(),
            Error::FirewallAlreadyEnabled
        ));

        fw.disable().unwrap();
        assert!(!fw.is_enabled());
        assert!(matches!(
            fw.disable().unwrap_err().cause(),
            Error::FirewallAlreadyDisabled
        ));
    }

    #[test]
    fn test_swap_conservation() {
        let noop = Arc::new(CountingAgent::new());
        let working = Arc::new(CountingAgent::new());
        let fw = Firewall::new(noop.clone(), working.clone(), false);

        let rules: Vec<Rule> = (0..5)
            .map(|i| Rule {
                direction: Direction::TwoWay,
                ..Rule::named(format!("rule{i}"))
            })
            .collect();
        fw.add(rules).unwrap();
        assert_eq!(noop.adds(), 5);

        fw.enable().unwrap();
        assert_eq!(noop.deletes(), 5);
        assert_eq!(working.adds(), 5);
        assert_eq!(working.deletes(), 0);
        // replayed in insertion order
        assert_eq!(
            working.calls(),
            (0..5).map(|i| format!("add:rule{i}")).collect::<Vec<_>>()
        );

        fw.disable().unwrap();
        assert_eq!(working.deletes(), 5);
        assert_eq!(noop.adds(), 10);
    }

    #[test]
    fn test_rules_added_while_enabled_go_to_working() {
        let working = Arc::new(CountingAgent::new());
        let fw = firewall(&working, false);
        fw.enable().unwrap();

        fw.add(vec![Rule::named("block")]).unwrap();
        assert_eq!(working.calls(), vec!["add:block"]);
    }

    #[test]
    fn test_flush_delegates_to_working() {
        let working = Arc::new(CountingAgent::new());
        let fw = firewall(&working, false);
        fw.add(vec![Rule::named("block")]).unwrap();

        fw.flush().unwrap();
        assert_eq!(working.calls(), vec!["flush"]);
        assert_eq!(names(&fw), vec!["block"]);
    }
}
