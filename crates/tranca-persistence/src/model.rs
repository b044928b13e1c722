//! Domain model types for the lock storage layer
//!
//! These types are returned from the `LockStore` trait, decoupled from
//! specific storage backends.

use serde::{Deserialize, Serialize};

use tranca_common::LockName;

/// A lock record as seen by a store
///
/// Stores only ever hand out live records; a record whose expiry has
/// passed behaves like an absent one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub name: LockName,
    /// Holder token the record is bound to
    pub token: String,
    /// Expiry in epoch milliseconds
    pub expires_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_round_trip() {
        let record = LockRecord {
            name: LockName::new("org.example.JobA").unwrap(),
            token: "token-1".to_string(),
            expires_at: 42,
        };

        let json = serde_json::to_string(&record).unwrap();
        let parsed: LockRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
