use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use serde::Serialize;

use jobq_core::{Job, JobId, JobPayload};
use jobq_infra::{
    config::Settings,
    job_store::{InMemoryJobStore, JobStore, PostgresJobStore},
    jobs::{
        DispatchError, DispatchGate, FailureFinalizer, HandlerRegistry, JobExecutor, JobQueries,
        QueryError, SimulatedWork, SubmittedJob, WorkerPool, WorkerPoolConfig, WorkerPoolHandle,
        WorkerStats,
    },
    task_queue::{InMemoryTaskQueue, RedisStreamsTaskQueue, TaskBroker},
};

pub type SharedStore = Arc<dyn JobStore>;
pub type SharedBroker = Arc<dyn TaskBroker>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    InMemory,
    Persistent,
}

/// Everything the HTTP handlers need, shared behind one `Arc`.
///
/// All methods are blocking; handlers call them from `spawn_blocking`.
pub struct AppServices {
    backend: Backend,
    dispatch: DispatchGate<SharedStore, SharedBroker>,
    queries: JobQueries<SharedStore>,
    workers: Mutex<Option<WorkerPoolHandle>>,
    postgres: Option<PostgresJobStore>,
}

impl AppServices {
    fn new(
        backend: Backend,
        store: SharedStore,
        broker: SharedBroker,
        workers: Option<WorkerPoolHandle>,
        postgres: Option<PostgresJobStore>,
    ) -> Self {
        Self {
            backend,
            dispatch: DispatchGate::new(Arc::clone(&store), broker),
            queries: JobQueries::new(store),
            workers: Mutex::new(workers),
            postgres,
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn submit(&self, job_type: &str, payload: JobPayload) -> Result<SubmittedJob, DispatchError> {
        self.dispatch.submit(job_type, payload)
    }

    pub fn job(&self, job_id: JobId) -> Result<Job, QueryError> {
        self.queries.get(job_id)
    }

    pub fn recent_jobs(&self, limit: usize) -> Result<Vec<Job>, QueryError> {
        self.queries.list_recent(limit)
    }

    /// `None` when this process runs no workers.
    pub fn worker_stats(&self) -> Option<WorkerStats> {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(WorkerPoolHandle::stats)
    }

    /// Stop embedded workers (waiting for in-flight tasks) and close the pool.
    pub async fn shutdown(&self) {
        let workers = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(workers) = workers {
            tracing::info!(workers = workers.workers(), "stopping embedded workers");
            if let Err(e) = tokio::task::spawn_blocking(move || workers.shutdown()).await {
                tracing::warn!(error = %e, "worker shutdown did not complete cleanly");
            }
        }
        if let Some(postgres) = &self.postgres {
            postgres.close().await;
        }
    }
}

/// Wire services from settings: Postgres + Redis when
/// `USE_PERSISTENT_STORES` is set, in-memory otherwise.
pub async fn build_services(settings: &Settings) -> anyhow::Result<AppServices> {
    let registry = HandlerRegistry::with_builtin_handlers(SimulatedWork::default());

    if settings.use_persistent_stores {
        return build_persistent_services(settings, registry).await;
    }

    tracing::warn!("USE_PERSISTENT_STORES is off; jobs live in memory and vanish on restart");
    let queue = Arc::new(
        InMemoryTaskQueue::new(settings.queue_name.clone())
            .with_visibility_timeout(settings.visibility_timeout),
    );
    build_in_memory_services(settings, registry, queue)
}

/// In-memory wiring (dev/test). The caller owns `queue` so tests can
/// inspect it or take it offline.
pub fn build_in_memory_services(
    settings: &Settings,
    registry: HandlerRegistry,
    queue: Arc<InMemoryTaskQueue>,
) -> anyhow::Result<AppServices> {
    let store: SharedStore = InMemoryJobStore::arc();
    let broker: SharedBroker = queue;

    let workers = if settings.embedded_workers {
        Some(spawn_workers(settings, registry, &store, &broker)?)
    } else {
        None
    };

    Ok(AppServices::new(Backend::InMemory, store, broker, workers, None))
}

async fn build_persistent_services(
    settings: &Settings,
    registry: HandlerRegistry,
) -> anyhow::Result<AppServices> {
    let database_url = settings
        .database_url
        .as_deref()
        .context("DATABASE_URL is required when USE_PERSISTENT_STORES is enabled")?;

    let postgres = PostgresJobStore::connect(database_url, settings.db_max_connections)
        .await
        .context("failed to connect to postgres")?;
    postgres
        .ensure_schema()
        .await
        .context("failed to create jobs table")?;

    let queue = RedisStreamsTaskQueue::new(&settings.redis_url, settings.queue_name.clone())
        .context("invalid REDIS_URL")?
        .with_visibility_timeout(settings.visibility_timeout);
    let queue = tokio::task::spawn_blocking(move || {
        queue.ping().context("redis is unreachable")?;
        queue
            .ensure_consumer_group()
            .context("failed to create redis consumer group")?;
        Ok::<_, anyhow::Error>(queue)
    })
    .await
    .context("redis setup task panicked")??;

    tracing::info!(queue = %settings.queue_name, "using postgres job store and redis task queue");

    let store: SharedStore = Arc::new(postgres.clone());
    let broker: SharedBroker = Arc::new(queue);

    let workers = if settings.embedded_workers {
        Some(spawn_workers(settings, registry, &store, &broker)?)
    } else {
        None
    };

    Ok(AppServices::new(
        Backend::Persistent,
        store,
        broker,
        workers,
        Some(postgres),
    ))
}

fn spawn_workers(
    settings: &Settings,
    registry: HandlerRegistry,
    store: &SharedStore,
    broker: &SharedBroker,
) -> anyhow::Result<WorkerPoolHandle> {
    let executor = Arc::new(
        JobExecutor::new(Arc::clone(store), registry).with_retry_policy(settings.retry_policy()),
    );
    let config = WorkerPoolConfig::default()
        .with_name("jobq-api-worker")
        .with_workers(settings.workers);

    WorkerPool::spawn(
        config,
        Arc::clone(broker),
        executor,
        FailureFinalizer::new(Arc::clone(store)),
    )
    .context("failed to spawn embedded workers")
}
