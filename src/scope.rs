//! Keyspace partitioning between installation-local and globally shared keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The keyspace a client (and every key it touches) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Installation,
    Global,
}

impl Scope {
    /// Namespace prefix prepended to every logical key of this scope.
    ///
    /// Every physical key carries exactly one of these prefixes and the two
    /// differ in their first byte, so the keyspaces can never overlap.
    pub fn prefix(&self) -> &'static str {
        match self {
            Scope::Installation => "inst:",
            Scope::Global => "global:",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Installation => "installation",
            Scope::Global => "global",
        }
    }

    /// Whether a physical key lives in this scope's keyspace.
    pub fn owns(&self, key: &PhysicalKey) -> bool {
        key.0.starts_with(self.prefix())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key as stored by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhysicalKey(String);

impl PhysicalKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The logical key with the scope prefix removed.
    pub fn logical(&self) -> &str {
        for scope in [Scope::Installation, Scope::Global] {
            if let Some(rest) = self.0.strip_prefix(scope.prefix()) {
                return rest;
            }
        }
        &self.0
    }
}

impl fmt::Display for PhysicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Map a logical key to its physical key in `scope`.
pub fn resolve(key: &str, scope: Scope) -> PhysicalKey {
    let mut physical = String::with_capacity(scope.prefix().len() + key.len());
    physical.push_str(scope.prefix());
    physical.push_str(key);
    PhysicalKey(physical)
}
