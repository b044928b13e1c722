//! Tranca Common - Shared types and utilities
//!
//! This crate provides the foundational types used across the lock service:
//! - Error types
//! - Validated, ordered lock names
//! - Holder token generation

pub mod error;
pub mod lock_name;
pub mod utils;

// Re-exports for convenience
pub use error::LockError;
pub use lock_name::LockName;
pub use utils::generate_token;
