//! Error types for the lock service
//!
//! This module defines:
//! - `LockError`: errors raised by lock stores and the job lock service
//! - retry classification used by the transaction runner

use crate::lock_name::LockName;

/// Errors raised by lock stores and the job lock service
#[derive(thiserror::Error, Debug)]
pub enum LockError {
    /// Terminal failure reported to callers once the retry schedule for a
    /// lock is exhausted, or when a refresh or release cannot proceed.
    #[error("failed to get lock '{name}' with token '{token}'")]
    Acquisition { name: LockName, token: String },

    /// A live record for the name exists under a different token.
    #[error("lock '{name}' is held by another holder")]
    Held { name: LockName },

    /// No live record exists for the name.
    #[error("lock '{name}' does not exist")]
    Missing { name: LockName },

    /// A live record exists but is bound to a different token.
    #[error("lock '{name}' is bound to another token")]
    HeldByOther { name: LockName },

    #[error("caused: {0}")]
    IllegalArgument(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Transient write collision in the backing store. The only variant the
    /// transaction runner retries.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl LockError {
    /// Whether the transaction runner may re-execute the unit of work.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::ConcurrencyConflict(_))
    }
}
