//! Durable job records.
//!
//! The store is the single source of truth for job state: the API writes new
//! rows, workers move them through their lifecycle, and status queries read
//! them back.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use r#trait::{JobLock, JobStore, JobStoreError};
