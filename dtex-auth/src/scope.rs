//! Scope Sets
//!
//! OAuth scopes as an ordered set, serialized as a space-delimited string.

use crate::error::{ExchangeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Set of permitted actions
///
/// Ordered so that the serialized form is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScopeSet {
    scopes: BTreeSet<String>,
}

impl ScopeSet {
    /// Create an empty scope set
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a space-delimited scope string (RFC 6749 §3.3)
    ///
    /// Repeated whitespace is tolerated; characters outside the scope-token
    /// grammar are rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut scopes = BTreeSet::new();
        for token in raw.split_whitespace() {
            if let Some(bad) = token.chars().find(|c| !is_scope_char(*c)) {
                return Err(ExchangeError::MalformedClaims(format!(
                    "Invalid character {:?} in scope token '{}'",
                    bad, token
                )));
            }
            scopes.insert(token.to_string());
        }
        Ok(Self { scopes })
    }

    /// Check if a scope is present
    pub fn contains(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    /// Check if this set is a subset of another
    pub fn is_subset_of(&self, parent: &ScopeSet) -> bool {
        self.scopes.is_subset(&parent.scopes)
    }

    /// Scopes present here but missing from `parent`
    pub fn missing_from<'a>(&'a self, parent: &'a ScopeSet) -> Vec<&'a str> {
        self.scopes
            .difference(&parent.scopes)
            .map(String::as_str)
            .collect()
    }

    /// Union of two sets
    pub fn union(&self, other: &ScopeSet) -> ScopeSet {
        Self {
            scopes: self.scopes.union(&other.scopes).cloned().collect(),
        }
    }

    /// Number of scopes
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Iterate scopes in order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.scopes.iter().map(String::as_str)
    }
}

// %x21 / %x23-5B / %x5D-7E
fn is_scope_char(c: char) -> bool {
    matches!(c, '\x21' | '\x23'..='\x5B' | '\x5D'..='\x7E')
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for scope in &self.scopes {
            if !first {
                f.write_str(" ")?;
            }
            f.write_str(scope)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for ScopeSet {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ScopeSet {
    type Error = ExchangeError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ScopeSet> for String {
    fn from(value: ScopeSet) -> Self {
        value.to_string()
    }
}

impl<S: Into<String>> FromIterator<S> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            scopes: iter.into_iter().map(Into::into).collect(),
        }
    }
}
