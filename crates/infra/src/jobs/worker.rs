//! Worker threads: fetch, execute, settle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::executor::{Disposition, ExecutionError, JobExecutor};
use crate::job_store::JobStore;
use crate::task_queue::{BrokerError, Delivery, FailureCallback, FailureReason, TaskBroker};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Thread and consumer name prefix.
    pub name: String,
    pub workers: usize,
    /// How long one fetch may block waiting for a task.
    pub fetch_timeout: Duration,
    /// Pause after a broker error before fetching again.
    pub error_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "jobq-worker".to_string(),
            workers: 4,
            fetch_timeout: Duration::from_secs(1),
            error_backoff: Duration::from_millis(500),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub busy: u64,
    pub dead_lettered: u64,
    pub errors: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Processes deliveries from one broker with one executor.
///
/// Cloning is cheap; clones share statistics.
pub struct Worker<S: JobStore, B: TaskBroker> {
    broker: B,
    executor: Arc<JobExecutor<S>>,
    on_failure: Arc<dyn FailureCallback>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<S: JobStore, B: TaskBroker + Clone> Clone for Worker<S, B> {
    fn clone(&self) -> Self {
        Self {
            broker: self.broker.clone(),
            executor: Arc::clone(&self.executor),
            on_failure: Arc::clone(&self.on_failure),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<S: JobStore, B: TaskBroker> Worker<S, B> {
    pub fn new(
        broker: B,
        executor: Arc<JobExecutor<S>>,
        on_failure: impl FailureCallback + 'static,
    ) -> Self {
        Self {
            broker,
            executor,
            on_failure: Arc::new(on_failure),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, f: impl FnOnce(&mut WorkerStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Fetch and settle at most one delivery.
    ///
    /// Returns `Ok(false)` if nothing arrived within `wait`.
    pub fn run_once(&self, consumer: &str, wait: Duration) -> Result<bool, BrokerError> {
        let Some(delivery) = self.broker.fetch(consumer, wait)? else {
            return Ok(false);
        };

        self.record(|s| {
            s.processed += 1;
            s.current_running += 1;
        });

        let result = self
            .executor
            .process_with_failure_hook(&delivery.message, self.on_failure.as_ref());
        let settled = self.settle(&delivery, result);

        self.record(|s| s.current_running = s.current_running.saturating_sub(1));
        settled.map(|()| true)
    }

    /// Acknowledge only after the outcome has been written to the store.
    fn settle(
        &self,
        delivery: &Delivery,
        result: Result<Disposition, ExecutionError>,
    ) -> Result<(), BrokerError> {
        let job_id = delivery.message.job_id;

        match result {
            Ok(Disposition::Completed) => {
                self.record(|s| s.completed += 1);
                self.broker.ack(delivery)
            }
            Ok(Disposition::AlreadyFinished(_)) => {
                self.record(|s| s.duplicates += 1);
                self.broker.ack(delivery)
            }
            Ok(Disposition::Busy) => {
                // The lease holder settles the job; this copy is a duplicate.
                self.record(|s| s.busy += 1);
                self.broker.ack(delivery)
            }
            Ok(Disposition::Retry { delay, next_attempt }) => {
                self.record(|s| s.retried += 1);
                debug!(job_id = %job_id, next_attempt, "rescheduling task");
                self.broker.reschedule(delivery, delay)
            }
            Ok(Disposition::Exhausted { error, attempts }) => {
                self.fail(delivery, FailureReason::RetriesExhausted { error, attempts })
            }
            Ok(Disposition::Rejected { error, attempts }) => {
                self.fail(delivery, FailureReason::Permanent { error, attempts })
            }
            Err(e @ (ExecutionError::JobNotFound(_) | ExecutionError::UnknownTask(_))) => {
                warn!(job_id = %job_id, error = %e, "task cannot be processed");
                self.record(|s| s.dead_lettered += 1);
                self.broker.dead_letter(delivery, &e.to_string())
            }
            Err(ExecutionError::Store(e)) => {
                // Left unacked: the broker redelivers after the visibility timeout.
                error!(job_id = %job_id, error = %e, "job store error while processing task");
                self.record(|s| s.errors += 1);
                Ok(())
            }
        }
    }

    /// The failure hook already ran inside the executor.
    fn fail(&self, delivery: &Delivery, reason: FailureReason) -> Result<(), BrokerError> {
        self.record(|s| {
            s.failed += 1;
            s.dead_lettered += 1;
        });
        self.broker.dead_letter(delivery, reason.error())
    }
}

/// Handle to control a running pool.
///
/// Dropping the handle stops the threads without waiting for them.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: Arc<AtomicBool>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Signal every worker and wait for in-flight tasks to settle.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    pub fn workers(&self) -> usize {
        self.joins.len()
    }
}

impl Drop for WorkerPoolHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

pub struct WorkerPool;

impl WorkerPool {
    /// Start `config.workers` OS threads consuming `broker`.
    pub fn spawn<S, B, F>(
        config: WorkerPoolConfig,
        broker: B,
        executor: Arc<JobExecutor<S>>,
        on_failure: F,
    ) -> std::io::Result<WorkerPoolHandle>
    where
        S: JobStore + 'static,
        B: TaskBroker + Clone + 'static,
        F: FailureCallback + 'static,
    {
        Self::spawn_worker(config, Worker::new(broker, executor, on_failure))
    }

    pub fn spawn_worker<S, B>(
        config: WorkerPoolConfig,
        worker: Worker<S, B>,
    ) -> std::io::Result<WorkerPoolHandle>
    where
        S: JobStore + 'static,
        B: TaskBroker + Clone + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::clone(&worker.stats);
        let mut joins = Vec::with_capacity(config.workers);

        for index in 0..config.workers.max(1) {
            let thread_name = format!("{}-{}", config.name, index);
            let consumer = format!("{}-{}-{}", config.name, std::process::id(), index);
            let worker = worker.clone();
            let stop = Arc::clone(&shutdown);
            let config = config.clone();

            let join = thread::Builder::new()
                .name(thread_name)
                .spawn(move || worker_loop(worker, &consumer, &config, &stop));

            match join {
                Ok(join) => joins.push(join),
                Err(e) => {
                    shutdown.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        info!(pool = %config.name, workers = joins.len(), "worker pool started");
        Ok(WorkerPoolHandle {
            shutdown,
            joins,
            stats,
            started: Instant::now(),
        })
    }
}

fn worker_loop<S: JobStore, B: TaskBroker>(
    worker: Worker<S, B>,
    consumer: &str,
    config: &WorkerPoolConfig,
    shutdown: &AtomicBool,
) {
    info!(consumer, queue = worker.broker.queue_name(), "worker started");

    while !shutdown.load(Ordering::SeqCst) {
        if let Err(e) = worker.run_once(consumer, config.fetch_timeout) {
            error!(consumer, error = %e, "broker error");
            worker.record(|s| s.errors += 1);
            thread::sleep(config.error_backoff);
        }
    }

    info!(consumer, "worker stopped");
}
