//! Broker boundary: at-least-once task delivery between the API and workers.
//!
//! The API enqueues one `process_job` task per accepted job. Workers fetch a
//! delivery, run it, and only then settle it (ack, reschedule or
//! dead-letter). A delivery that is never settled becomes visible again after
//! the visibility timeout, so a worker crash can redeliver but never lose a
//! task.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use jobq_core::JobId;

pub use in_memory::InMemoryTaskQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsTaskQueue;

/// Name of the only task the workers understand.
pub const PROCESS_JOB_TASK: &str = "process_job";

/// Default queue name shared by the API and the workers.
pub const DEFAULT_QUEUE_NAME: &str = "job_queue";

/// Message carried by the broker.
///
/// Only the job id and the attempt counter travel; everything else is read
/// from the job store when the task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub message_id: Uuid,
    pub task: String,
    pub job_id: JobId,
    /// 0 for the first delivery, incremented on every reschedule.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskMessage {
    pub fn process_job(job_id: JobId) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            task: PROCESS_JOB_TASK.to_string(),
            job_id,
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// The message that carries the next retry of this one.
    pub fn next_attempt(&self) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            task: self.task.clone(),
            job_id: self.job_id,
            attempt: self.attempt.saturating_add(1),
            enqueued_at: Utc::now(),
        }
    }
}

/// A fetched, not yet settled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-specific handle used to settle this delivery.
    pub receipt: String,
    pub message: TaskMessage,
}

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The broker cannot be reached. Submissions surface this as 503.
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

/// Work queue with late acknowledgement.
pub trait TaskBroker: Send + Sync {
    fn queue_name(&self) -> &str;

    fn enqueue(&self, message: TaskMessage) -> Result<(), BrokerError>;

    /// Make `message` deliverable once `delay` has elapsed.
    fn enqueue_after(&self, message: TaskMessage, delay: Duration) -> Result<(), BrokerError>;

    /// Wait up to `wait` for the next delivery.
    fn fetch(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Settle a delivery for good. Acking an unknown or already settled
    /// receipt is not an error.
    fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Park a delivery on the dead-letter list and settle it.
    fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError>;

    /// Schedule the next attempt after `delay`, then settle this delivery.
    ///
    /// If settling fails the old delivery may come back as a duplicate; the
    /// executor tolerates that.
    fn reschedule(&self, delivery: &Delivery, delay: Duration) -> Result<(), BrokerError> {
        self.enqueue_after(delivery.message.next_attempt(), delay)?;
        self.ack(delivery)
    }
}

impl<B> TaskBroker for Arc<B>
where
    B: TaskBroker + ?Sized,
{
    fn queue_name(&self) -> &str {
        (**self).queue_name()
    }

    fn enqueue(&self, message: TaskMessage) -> Result<(), BrokerError> {
        (**self).enqueue(message)
    }

    fn enqueue_after(&self, message: TaskMessage, delay: Duration) -> Result<(), BrokerError> {
        (**self).enqueue_after(message, delay)
    }

    fn fetch(&self, consumer: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        (**self).fetch(consumer, wait)
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        (**self).ack(delivery)
    }

    fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError> {
        (**self).dead_letter(delivery, reason)
    }

    fn reschedule(&self, delivery: &Delivery, delay: Duration) -> Result<(), BrokerError> {
        (**self).reschedule(delivery, delay)
    }
}

/// Why a task gave up for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// A transient failure on the last allowed attempt.
    RetriesExhausted { error: String, attempts: u32 },
    /// The handler reported a failure that retrying cannot fix.
    Permanent { error: String, attempts: u32 },
}

impl FailureReason {
    pub fn error(&self) -> &str {
        match self {
            FailureReason::RetriesExhausted { error, .. } | FailureReason::Permanent { error, .. } => {
                error
            }
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            FailureReason::RetriesExhausted { attempts, .. }
            | FailureReason::Permanent { attempts, .. } => *attempts,
        }
    }
}

/// Hook run by the worker once a task fails terminally, before the delivery
/// is settled.
///
/// Implementations must not panic and must swallow their own errors: the
/// worker settles the delivery regardless of what the hook does.
pub trait FailureCallback: Send + Sync {
    fn on_failure(&self, message: &TaskMessage, reason: &FailureReason);
}

impl<F> FailureCallback for Arc<F>
where
    F: FailureCallback + ?Sized,
{
    fn on_failure(&self, message: &TaskMessage, reason: &FailureReason) {
        (**self).on_failure(message, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_attempt_keeps_job_and_bumps_attempt() {
        let first = TaskMessage::process_job(JobId::new(3));
        assert_eq!(first.task, PROCESS_JOB_TASK);
        assert_eq!(first.attempt, 0);

        let second = first.next_attempt();
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(second.attempt, 1);
        assert_ne!(second.message_id, first.message_id);
    }

    #[test]
    fn task_message_json_shape() {
        let msg = TaskMessage::process_job(JobId::new(12));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["task"], "process_job");
        assert_eq!(value["job_id"], 12);
        assert_eq!(value["attempt"], 0);

        let back: TaskMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }
}
