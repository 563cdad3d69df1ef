//! Reserved-name guard
//!
//! The set is built once at startup and only read afterwards, so it is
//! shared behind an `Arc` without locking.

use crate::config::ReservedConfig;
use crate::error::DispatchError;
use crate::request::DispatchStrategy;
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct ReservedNameSet {
    names: HashSet<String>,
    /// Reserved names reachable through path/query dispatch only
    internal_allow: HashSet<String>,
}

impl ReservedNameSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names.into_iter().map(|n| n.as_ref().to_ascii_lowercase()).collect(),
            internal_allow: HashSet::new(),
        }
    }

    /// Allow-list reserved names for the administrative dispatch forms
    pub fn with_internal_allow<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.internal_allow = names
            .into_iter()
            .map(|n| n.as_ref().to_ascii_lowercase())
            .filter(|n| self.names.contains(n))
            .collect();
        self
    }

    pub fn from_config(config: &ReservedConfig) -> Self {
        Self::new(&config.names).with_internal_allow(&config.internal_allow)
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.names.contains(identifier)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Reject reserved identifiers. Only path and query dispatch may reach
    /// an explicitly allow-listed name; every other strategy is always denied.
    pub fn check(&self, identifier: &str, strategy: DispatchStrategy) -> Result<(), DispatchError> {
        if !self.names.contains(identifier) {
            return Ok(());
        }

        let allowed = matches!(strategy, DispatchStrategy::Path | DispatchStrategy::Query)
            && self.internal_allow.contains(identifier);

        if allowed {
            Ok(())
        } else {
            Err(DispatchError::ForbiddenTarget(identifier.to_string()))
        }
    }
}
