//! Scope sets for capability tokens
//!
//! A scope is a named permission such as `:notifications` or `:signout`.
//! Scope names starting with `:` conventionally map to a single endpoint;
//! the wildcard scope `*` authorizes everything.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The wildcard scope that authorizes any operation
pub const WILDCARD_SCOPE: &str = "*";

/// An ordered, deduplicated set of scopes carried by a token
///
/// BTreeSet keeps the serialized payload deterministic, so two tokens issued
/// with the same scopes sign identical bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeSet {
    scopes: BTreeSet<String>,
}

impl ScopeSet {
    pub fn new() -> Self {
        Self {
            scopes: BTreeSet::new(),
        }
    }

    /// A set containing only the wildcard scope
    pub fn wildcard() -> Self {
        let mut set = Self::new();
        set.add(WILDCARD_SCOPE);
        set
    }

    /// Add a scope to the set (verbatim, duplicates collapse)
    pub fn add(&mut self, scope: impl Into<String>) {
        self.scopes.insert(scope.into());
    }

    /// Check whether this set authorizes the required scope
    pub fn authorizes(&self, required: &str) -> bool {
        self.scopes.contains(WILDCARD_SCOPE) || self.scopes.contains(required)
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.scopes.iter().map(String::as_str)
    }
}

impl FromIterator<String> for ScopeSet {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self {
            scopes: iter.into_iter().collect(),
        }
    }
}

impl<'a> FromIterator<&'a str> for ScopeSet {
    fn from_iter<T: IntoIterator<Item = &'a str>>(iter: T) -> Self {
        Self {
            scopes: iter.into_iter().map(str::to_string).collect(),
        }
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for scope in &self.scopes {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", scope)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_membership() {
        let scopes: ScopeSet = [":notifications", ":signout"].into_iter().collect();

        assert!(scopes.authorizes(":notifications"));
        assert!(scopes.authorizes(":signout"));
        assert!(!scopes.authorizes(":authorize_token"));
    }

    #[test]
    fn test_wildcard_authorizes_everything() {
        let scopes = ScopeSet::wildcard();

        assert!(scopes.authorizes(":notifications"));
        assert!(scopes.authorizes(":anything_at_all"));
    }

    #[test]
    fn test_duplicates_collapse() {
        let scopes: ScopeSet = [":signout", ":signout"].into_iter().collect();
        assert_eq!(scopes.len(), 1);
    }

    #[test]
    fn test_empty_set_authorizes_nothing() {
        let scopes = ScopeSet::new();
        assert!(!scopes.authorizes(":notifications"));
    }
}
