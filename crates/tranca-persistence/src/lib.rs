//! Tranca Persistence - Lock record storage backends
//!
//! This crate provides:
//! - The `LockStore` trait all backends implement
//! - An in-memory store for single-process deployments and tests
//! - A relational store (MySQL/PostgreSQL via SeaORM) acting as the
//!   shared arbiter across processes

pub mod db;
pub mod entity;
pub mod memory;
pub mod model;
pub mod store;

// Re-export sea-orm for convenience
pub use sea_orm;

// Re-export the store abstraction and backends
pub use db::DbLockStore;
pub use memory::InMemoryLockStore;
pub use model::LockRecord;
pub use store::LockStore;
