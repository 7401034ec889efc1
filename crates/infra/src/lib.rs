//! Infrastructure layer: job store, task queue, job pipeline, config.

pub mod config;
pub mod job_store;
pub mod jobs;
pub mod task_queue;
