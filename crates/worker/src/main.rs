//! Standalone worker process: consumes the Redis queue and writes job state
//! to Postgres. Run as many of these as needed next to `jobq-api` started with
//! `JOBQ_EMBEDDED_WORKERS=false`.

use std::sync::Arc;

use anyhow::{Context, bail};

use jobq_infra::config::Settings;
use jobq_infra::job_store::PostgresJobStore;
use jobq_infra::jobs::{
    FailureFinalizer, HandlerRegistry, JobExecutor, SimulatedWork, WorkerPool, WorkerPoolConfig,
};
use jobq_infra::task_queue::RedisStreamsTaskQueue;

fn main() -> anyhow::Result<()> {
    jobq_observability::init();

    let settings = Settings::from_env().context("invalid configuration")?;
    if !settings.use_persistent_stores {
        bail!("jobq-worker needs USE_PERSISTENT_STORES=true; in-memory mode runs workers inside jobq-api");
    }
    let database_url = settings
        .database_url
        .clone()
        .context("DATABASE_URL is required")?;

    // Store calls block on this runtime from the worker threads.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let store = runtime.block_on(async {
        let store = PostgresJobStore::connect(&database_url, settings.db_max_connections).await?;
        store.ensure_schema().await?;
        Ok::<_, jobq_infra::job_store::JobStoreError>(store)
    })
    .context("failed to prepare postgres job store")?;

    let queue = RedisStreamsTaskQueue::new(&settings.redis_url, settings.queue_name.clone())
        .context("invalid REDIS_URL")?
        .with_visibility_timeout(settings.visibility_timeout);
    queue.ping().context("redis is unreachable")?;
    queue
        .ensure_consumer_group()
        .context("failed to create redis consumer group")?;

    let store = Arc::new(store);
    let executor = Arc::new(
        JobExecutor::new(
            Arc::clone(&store),
            HandlerRegistry::with_builtin_handlers(SimulatedWork::default()),
        )
        .with_retry_policy(settings.retry_policy()),
    );

    let pool = WorkerPool::spawn(
        WorkerPoolConfig::default().with_workers(settings.workers),
        Arc::new(queue),
        executor,
        FailureFinalizer::new(Arc::clone(&store)),
    )
    .context("failed to spawn workers")?;

    tracing::info!(
        queue = %settings.queue_name,
        workers = pool.workers(),
        "worker process started"
    );

    runtime.block_on(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    });

    tracing::info!(stats = ?pool.stats(), "shutdown requested; draining workers");
    pool.shutdown();
    runtime.block_on(store.close());
    tracing::info!("worker process stopped");
    Ok(())
}
