//! Job processing pipeline.
//!
//! ## Components
//!
//! - `DispatchGate`: persists a submission, then enqueues its task
//! - `JobExecutor`: runs one delivery, owns the `processing`/`retrying`/
//!   `completed` transitions and the retry decision
//! - `FailureFinalizer`: failure hook that writes terminal `failed`
//! - `JobQueries`: status lookups and the recent-jobs listing
//! - `HandlerRegistry`: maps job types to handlers
//! - `WorkerPool`: OS threads that fetch, execute and settle deliveries

pub mod dispatch;
pub mod executor;
pub mod finalizer;
pub mod handlers;
pub mod query;
pub mod worker;

pub use dispatch::{DispatchError, DispatchGate, SubmittedJob};
pub use executor::{Disposition, ExecutionError, JobExecutor};
pub use finalizer::{FailureFinalizer, failure_details};
pub use handlers::{
    DefaultHandler, FlakyHandler, FnHandler, HandlerRegistry, JobContext, JobHandler, QuickHandler,
    SimulatedWork, SlowHandler,
};
pub use query::{JobQueries, MAX_RECENT_JOBS, QueryError};
pub use worker::{Worker, WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerStats};
