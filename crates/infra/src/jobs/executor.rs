//! Runs one delivered task against the job store.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use jobq_core::{HandlerOutcome, Job, JobId, JobPatch, JobStatus, RetryPolicy};

use super::handlers::{HandlerRegistry, JobContext, JobHandler};
use crate::job_store::{JobStore, JobStoreError};
use crate::task_queue::{FailureCallback, FailureReason, PROCESS_JOB_TASK, TaskMessage};

/// What the worker should do with the delivery after `process`.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Job is `completed`. Ack.
    Completed,
    /// Job was already terminal, either on arrival (duplicate delivery) or
    /// because a writer finished it while the handler ran. Ack, nothing
    /// changed.
    AlreadyFinished(JobStatus),
    /// Another delivery of the same job holds the lease. That holder settles
    /// the job, so this copy is dropped.
    Busy,
    /// Job is `retrying` with `retries` bumped. Reschedule after `delay`.
    Retry { delay: Duration, next_attempt: u32 },
    /// Transient failure with no retries left. The failure hook, if any, has
    /// already run under the lease.
    Exhausted { error: String, attempts: u32 },
    /// Permanent failure. The failure hook, if any, has already run under the
    /// lease.
    Rejected { error: String, attempts: u32 },
}

#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Drives a job through `processing`/`retrying` and records the handler's
/// outcome.
///
/// Every write happens while the job's lease is held. Exhausted and rejected
/// jobs go to the failure hook before the lease is released, and a write that
/// finds the row already terminal leaves it alone.
pub struct JobExecutor<S: JobStore> {
    store: S,
    registry: HandlerRegistry,
    default_policy: RetryPolicy,
}

impl<S: JobStore> JobExecutor<S> {
    pub fn new(store: S, registry: HandlerRegistry) -> Self {
        Self {
            store,
            registry,
            default_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Run one delivery without a failure hook; exhausted and rejected jobs
    /// are left for the caller.
    pub fn process(&self, message: &TaskMessage) -> Result<Disposition, ExecutionError> {
        self.run(message, None)
    }

    /// Run one delivery and hand terminal failures to `on_failure` before the
    /// lease is released.
    pub fn process_with_failure_hook(
        &self,
        message: &TaskMessage,
        on_failure: &dyn FailureCallback,
    ) -> Result<Disposition, ExecutionError> {
        self.run(message, Some(on_failure))
    }

    #[instrument(
        skip(self, message, on_failure),
        fields(job_id = %message.job_id, attempt = message.attempt)
    )]
    fn run(
        &self,
        message: &TaskMessage,
        on_failure: Option<&dyn FailureCallback>,
    ) -> Result<Disposition, ExecutionError> {
        if message.task != PROCESS_JOB_TASK {
            return Err(ExecutionError::UnknownTask(message.task.clone()));
        }

        let job_id = message.job_id;
        let Some(_lease) = self.store.lock_job(job_id)? else {
            debug!("job is leased by another delivery");
            return Ok(Disposition::Busy);
        };

        let job = self
            .store
            .get(job_id)?
            .ok_or(ExecutionError::JobNotFound(job_id))?;

        if job.status.is_terminal() {
            info!(status = %job.status, "job already finished; skipping duplicate delivery");
            return Ok(Disposition::AlreadyFinished(job.status));
        }

        if let Err(status) = self.transition(job_id, &JobPatch::claim(message.attempt))? {
            return Ok(finished_elsewhere(status));
        }

        let handler = self.registry.resolve(&job.job_type);
        let policy = handler
            .retry_policy()
            .unwrap_or_else(|| self.default_policy.clone());
        let ctx = JobContext {
            job_id,
            job_type: &job.job_type,
            payload: &job.payload,
            attempt: message.attempt,
        };

        info!(job_type = %job.job_type, handler = handler.name(), "running job");
        let started = Instant::now();
        let outcome = run_guarded(handler.as_ref(), &ctx);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let attempts = message.attempt.saturating_add(1);

        match outcome {
            HandlerOutcome::Success(result) => {
                if let Err(status) = self.transition(job_id, &JobPatch::completed(result))? {
                    return Ok(finished_elsewhere(status));
                }
                info!(elapsed_ms, "job completed");
                Ok(Disposition::Completed)
            }
            HandlerOutcome::TransientFailure { error, retry_after } => {
                if !policy.should_retry(message.attempt) {
                    warn!(elapsed_ms, error = %error, attempts, "job failed; retries exhausted");
                    if let Some(hook) = on_failure {
                        let reason = FailureReason::RetriesExhausted {
                            error: error.clone(),
                            attempts,
                        };
                        hook.on_failure(message, &reason);
                    }
                    return Ok(Disposition::Exhausted { error, attempts });
                }

                let job = match self.transition(job_id, &JobPatch::retry_scheduled())? {
                    Ok(job) => job,
                    Err(status) => return Ok(finished_elsewhere(status)),
                };
                let next_attempt = message.attempt.saturating_add(1);
                let delay = retry_after.unwrap_or_else(|| policy.delay_for_retry(next_attempt));
                warn!(
                    elapsed_ms,
                    error = %error,
                    retries = job.retries,
                    delay_ms = delay.as_millis() as u64,
                    "job failed; retry scheduled"
                );
                Ok(Disposition::Retry {
                    delay,
                    next_attempt,
                })
            }
            HandlerOutcome::PermanentFailure(error) => {
                warn!(elapsed_ms, error = %error, attempts, "job failed permanently");
                if let Some(hook) = on_failure {
                    let reason = FailureReason::Permanent {
                        error: error.clone(),
                        attempts,
                    };
                    hook.on_failure(message, &reason);
                }
                Ok(Disposition::Rejected { error, attempts })
            }
        }
    }

    /// `Ok(Err(status))` when the row is already terminal and was left as is.
    fn transition(
        &self,
        job_id: JobId,
        patch: &JobPatch,
    ) -> Result<Result<Job, JobStatus>, ExecutionError> {
        match self.store.update(job_id, patch) {
            Ok(job) => Ok(Ok(job)),
            Err(JobStoreError::Terminal { status, .. }) => Ok(Err(status)),
            Err(JobStoreError::NotFound(id)) => Err(ExecutionError::JobNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }
}

fn finished_elsewhere(status: JobStatus) -> Disposition {
    warn!(status = %status, "job reached a terminal state while running; outcome discarded");
    Disposition::AlreadyFinished(status)
}

/// A panicking handler counts as a transient failure.
fn run_guarded(handler: &dyn JobHandler, ctx: &JobContext<'_>) -> HandlerOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(ctx))) {
        Ok(outcome) => outcome,
        Err(panic) => HandlerOutcome::transient(format!(
            "handler '{}' panicked: {}",
            handler.name(),
            panic_message(panic.as_ref())
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
