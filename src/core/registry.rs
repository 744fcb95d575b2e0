//! Authoritative in-memory record of active rules
//!
//! Rules are keyed by name and remembered in insertion order. The order is
//! what the firewall replays when switching backends.

use crate::core::error::{Error, Result};
use crate::core::rule::Rule;
use std::collections::HashMap;

/// Rules stored in the order they were added
#[derive(Debug, Default, Clone)]
pub struct OrderedRules {
    rules: HashMap<String, Rule>,
    // names in insertion order
    order: Vec<String>,
}

impl OrderedRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a rule.
    ///
    /// # Errors
    ///
    /// - `RuleWithoutName` if the name is empty
    /// - `RuleAlreadyExists` if a rule with the same name is stored
    pub fn add(&mut self, rule: Rule) -> Result<()> {
        if rule.name.is_empty() {
            return Err(Error::RuleWithoutName);
        }
        if self.rules.contains_key(&rule.name) {
            return Err(Error::RuleAlreadyExists);
        }
        self.order.push(rule.name.clone());
        self.rules.insert(rule.name.clone(), rule);
        Ok(())
    }

    /// Returns a copy of the stored rule.
    pub fn get(&self, name: &str) -> Result<Rule> {
        self.rules.get(name).cloned().ok_or(Error::RuleNotFound)
    }

    /// Removes a rule, keeping the relative order of the others.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        if self.rules.remove(name).is_none() {
            return Err(Error::RuleNotFound);
        }
        self.order.retain(|stored| stored != name);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterates rules in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.order.iter().filter_map(|name| self.rules.get(name))
    }
}
