//! Hierarchical lock names
//!
//! A lock name is a dot separated path such as `org.example.sync.UserSync`.
//! Segments are restricted to a conservative identifier alphabet so that
//! names persist and compare identically across backing databases.

use std::fmt::{Display, Formatter};
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::error::LockError;

/// Regex pattern for validating lock names: non-empty dot separated segments
static NAME_PATTERN: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new("^[a-zA-Z0-9_:-]+(\\.[a-zA-Z0-9_:-]+)*$").expect("Invalid regex pattern")
});

/// Maximum lock name length, matching the backing column width
pub const MAX_NAME_LEN: usize = 255;

/// A validated, hierarchical lock name.
///
/// Names compare lexicographically on their string form. That order is what
/// the per-transaction lock tracker enforces to keep acquisition deadlock
/// free.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LockName(String);

impl LockName {
    /// Parse and validate a lock name.
    ///
    /// # Examples
    ///
    /// ```
    /// use tranca_common::LockName;
    ///
    /// assert!(LockName::new("org.example.UserSync").is_ok());
    /// assert!(LockName::new("jobs").is_ok());
    /// assert!(LockName::new("").is_err());
    /// assert!(LockName::new("a..b").is_err());
    /// ```
    pub fn new(name: &str) -> Result<LockName, LockError> {
        if name.len() > MAX_NAME_LEN {
            return Err(LockError::IllegalArgument(format!(
                "lock name is longer than {} characters",
                MAX_NAME_LEN
            )));
        }
        if !NAME_PATTERN.is_match(name) {
            return Err(LockError::IllegalArgument(format!(
                "invalid lock name '{}': expected dot separated segments of [a-zA-Z0-9_:-]",
                name
            )));
        }
        Ok(LockName(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for LockName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for LockName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for LockName {
    type Error = LockError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        LockName::new(&value)
    }
}

impl From<LockName> for String {
    fn from(value: LockName) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(LockName::new("jobs").is_ok());
        assert!(LockName::new("org.example.UserSync").is_ok());
        assert!(LockName::new("org.example.sync:batch-1").is_ok());
        assert!(LockName::new("a_b.c-d.e:f").is_ok());
        assert!(LockName::new("0.1.2").is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert!(LockName::new("").is_err());
        assert!(LockName::new(".jobs").is_err());
        assert!(LockName::new("jobs.").is_err());
        assert!(LockName::new("a..b").is_err());
        assert!(LockName::new("with space").is_err());
        assert!(LockName::new("with/slash").is_err());
        assert!(LockName::new("with@at").is_err());
    }

    #[test]
    fn test_name_length_limit() {
        let max = "x".repeat(MAX_NAME_LEN);
        assert!(LockName::new(&max).is_ok());

        let over = "x".repeat(MAX_NAME_LEN + 1);
        assert!(LockName::new(&over).is_err());
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let a = LockName::new("org.example.a").unwrap();
        let ab = LockName::new("org.example.a.b").unwrap();
        let b = LockName::new("org.example.b").unwrap();

        assert!(a < ab);
        assert!(ab < b);
        assert!(a < b);
    }

    #[test]
    fn test_serde_round_trip() {
        let name = LockName::new("org.example.UserSync").unwrap();
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"org.example.UserSync\"");

        let parsed: LockName = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn test_serde_rejects_invalid_names() {
        let result: Result<LockName, _> = serde_json::from_str("\"a..b\"");
        assert!(result.is_err());
    }

    proptest! {
        #[test]
        fn generated_names_validate(name in "[a-z][a-z0-9_]{0,7}(\\.[a-z][a-z0-9_]{0,7}){0,3}") {
            prop_assert!(LockName::new(&name).is_ok());
        }

        #[test]
        fn ordering_matches_string_ordering(
            a in "[a-z]{1,6}(\\.[a-z]{1,6}){0,2}",
            b in "[a-z]{1,6}(\\.[a-z]{1,6}){0,2}",
        ) {
            let la = LockName::new(&a).unwrap();
            let lb = LockName::new(&b).unwrap();
            prop_assert_eq!(la.cmp(&lb), a.cmp(&b));
        }
    }
}
