//! Tranca Core - Distributed job lock coordination
//!
//! This crate provides:
//! - An explicit transaction context with commit/rollback hooks
//! - A transaction runner that retries transient concurrency conflicts
//! - The job lock service: ordered transactional locks and manual locks
//! - A timed refresh scheduler keeping long-running jobs' locks alive

pub mod service;

// Re-export commonly used types
pub use service::job_lock::{JobLockConfig, JobLockService};
pub use service::refresh::{JobLockRefreshCallback, RefreshScheduler, ScheduledRefresh};
pub use service::transaction::{
    TransactionContext, TransactionOptions, TransactionRetryConfig, TransactionRunner,
    TransactionState,
};

// Re-export the shared types callers need alongside the service
pub use tranca_common::{LockError, LockName, generate_token};
pub use tranca_persistence::{DbLockStore, InMemoryLockStore, LockRecord, LockStore};
