// Job lock services: transaction lifecycle, ordered acquisition, timed refresh

pub mod job_lock;
pub mod refresh;
pub mod transaction;

// Re-export commonly used types
pub use job_lock::JobLockService;
pub use transaction::TransactionRunner;
