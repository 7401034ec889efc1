//! `jobq-core`: job model shared by the API, the workers and the stores.
//!
//! This crate is pure domain code: no I/O, no runtime.

pub mod error;
pub mod id;
pub mod job;
pub mod outcome;
pub mod retry;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{Job, JobPatch, JobPayload, JobStatus, NewJob};
pub use outcome::HandlerOutcome;
pub use retry::{BackoffStrategy, RetryPolicy};
