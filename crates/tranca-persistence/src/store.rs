//! Lock store trait
//!
//! Defines the interface every lock storage backend implements. One store
//! is the single arbiter of ownership for all cooperating processes.

use std::time::Duration;

use async_trait::async_trait;

use tranca_common::{LockError, LockName};

use crate::model::LockRecord;

/// Atomic lock record operations
///
/// Implementations guarantee at most one live record per name and treat an
/// expired record exactly like an absent one: `acquire` overwrites it,
/// `refresh` and `release` report it as missing.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Bind the record for `name` to `token` until `ttl` elapses.
    ///
    /// Succeeds when the record is absent, expired, or already bound to
    /// `token` (re-acquiring with the owning token extends the expiry).
    /// Fails with [`LockError::Held`] when a live record is bound to
    /// another token.
    async fn acquire(&self, name: &LockName, token: &str, ttl: Duration) -> Result<(), LockError>;

    /// Push the expiry of the record for `name` out by `ttl`.
    ///
    /// Fails with [`LockError::Missing`] when no live record exists, or
    /// [`LockError::HeldByOther`] when it is bound to another token.
    async fn refresh(&self, name: &LockName, token: &str, ttl: Duration) -> Result<(), LockError>;

    /// Delete the record for `name` if it is live and bound to `token`.
    ///
    /// Fails with the same errors as [`LockStore::refresh`].
    async fn release(&self, name: &LockName, token: &str) -> Result<(), LockError>;

    /// Fetch the live record for `name`, if any.
    async fn find(&self, name: &LockName) -> Result<Option<LockRecord>, LockError>;
}

/// Clock for expiry decisions, epoch milliseconds
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Expiry instant for a lock taken at `now`, saturating so an oversized
/// TTL reads as never expiring instead of wrapping negative
pub(crate) fn expiry_after(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_after_adds_ttl() {
        assert_eq!(expiry_after(1_000, Duration::from_secs(60)), 61_000);
    }

    #[test]
    fn test_expiry_after_saturates() {
        assert_eq!(expiry_after(1_000, Duration::MAX), i64::MAX);
        assert_eq!(expiry_after(i64::MAX - 5, Duration::from_secs(1)), i64::MAX);
    }
}
