//! SeaORM entity definitions

pub mod job_lock;

pub mod prelude {
    pub use super::job_lock::Entity as JobLock;
}
