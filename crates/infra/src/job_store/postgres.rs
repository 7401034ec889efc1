//! Postgres-backed job store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (check constraint violation) | `23514` | `Storage` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / PoolTimedOut / Io / Tls | N/A | `Unavailable` |
//! | Other | N/A | `Storage` |
//!
//! ## Runtime bridging
//!
//! `JobStore` is synchronous. The store keeps the `Handle` of the runtime that
//! owns its pool and blocks on it, so trait methods must be called from a
//! thread that is not driving that runtime: a worker thread or a
//! `spawn_blocking` task.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row};
use tokio::runtime::Handle;
use tracing::{Span, field, instrument, warn};

use jobq_core::{Job, JobId, JobPatch, JobPayload, JobStatus, NewJob};

use super::r#trait::{JobLock, JobStore, JobStoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id            BIGSERIAL PRIMARY KEY,
    job_type      TEXT        NOT NULL,
    payload       JSONB       NOT NULL DEFAULT '{}'::jsonb,
    status        TEXT        NOT NULL DEFAULT 'queued'
                  CHECK (status IN ('queued', 'processing', 'retrying', 'completed', 'failed')),
    retries       INTEGER     NOT NULL DEFAULT 0 CHECK (retries >= 0),
    result        JSONB,
    error_message JSONB,
    created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const JOB_COLUMNS: &str =
    "id, job_type, payload, status, retries, result, error_message, created_at, updated_at";

/// Durable job table in PostgreSQL.
///
/// Every write runs in its own transaction, committed before the call
/// returns. Processing leases are session-level advisory locks keyed by job id.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    /// Open a pool against `database_url` on the current runtime.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, Handle::current()))
    }

    /// Create the `jobs` table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[instrument(skip(self, job), fields(job_type = %job.job_type, job_id = field::Empty), err)]
    pub async fn insert_job(&self, job: NewJob) -> Result<Job, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            "INSERT INTO jobs (job_type, payload, status, retries) \
             VALUES ($1, $2, 'queued', 0) RETURNING {JOB_COLUMNS}"
        ))
        .bind(&job.job_type)
        .bind(Json(&job.payload))
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        let stored = job_from_row(&row)?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("job_id", stored.id.get());
        Ok(stored)
    }

    pub async fn fetch_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn fetch_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY id DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_recent", e))?;

        rows.iter().map(job_from_row).collect()
    }

    /// Apply a patch in one transaction.
    ///
    /// `retries` is incremented in SQL so concurrent writers cannot lose a
    /// bump.
    #[instrument(skip(self, patch), fields(job_id = %job_id, status = %patch.status()), err)]
    pub async fn apply_patch(&self, job_id: JobId, patch: &JobPatch) -> Result<Job, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let updated = sqlx::query(&format!(
            "UPDATE jobs SET status = $2, result = $3, error_message = $4, \
             retries = retries + $5, updated_at = GREATEST(NOW(), created_at) \
             WHERE id = $1 AND status NOT IN ('completed', 'failed') \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id.get())
        .bind(patch.status().as_str())
        .bind(patch.result().cloned())
        .bind(patch.error_message().cloned())
        .bind(if patch.bumps_retries() { 1_i32 } else { 0_i32 })
        .fetch_optional(&mut *tx)
        .await;

        let row = match updated {
            Ok(Some(row)) => row,
            Ok(None) => {
                // Either no such row or a terminal one; tell them apart.
                let current: Result<Option<String>, _> =
                    sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
                        .bind(job_id.get())
                        .fetch_optional(&mut *tx)
                        .await;
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;

                return match current.map_err(|e| map_sqlx_error("update_job", e))? {
                    None => Err(JobStoreError::NotFound(job_id)),
                    Some(status) => Err(JobStoreError::Terminal {
                        job_id,
                        status: parse_status(&status)?,
                    }),
                };
            }
            Err(e) => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(map_sqlx_error("update_job", e));
            }
        };

        let job = job_from_row(&row)?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(job)
    }

    /// Take a session advisory lock on a dedicated pooled connection.
    ///
    /// The connection stays checked out for as long as the lock is held.
    pub async fn try_advisory_lock(
        &self,
        job_id: JobId,
    ) -> Result<Option<PoolConnection<Postgres>>, JobStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_connection", e))?;

        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(job_id.get())
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("try_advisory_lock", e))?;

        Ok(locked.then_some(conn))
    }
}

/// Releases the advisory lock when the `JobLock` is dropped.
struct AdvisoryLease {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
    handle: Handle,
}

impl Drop for AdvisoryLease {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        let released = self.handle.block_on(
            sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
                .bind(self.key)
                .fetch_one(&mut *conn),
        );

        match released {
            Ok(true) => {}
            Ok(false) => warn!(job_id = self.key, "advisory lock was not held at release"),
            Err(e) => {
                // Ending the session is the only other way to free the lock.
                warn!(job_id = self.key, error = %e, "advisory unlock failed; closing connection");
                drop(conn.detach());
            }
        }
    }
}

impl JobStore for PostgresJobStore {
    fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
        self.handle.block_on(self.insert_job(job))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.handle.block_on(self.fetch_job(job_id))
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.handle.block_on(self.fetch_recent(limit))
    }

    fn update(&self, job_id: JobId, patch: &JobPatch) -> Result<Job, JobStoreError> {
        self.handle.block_on(self.apply_patch(job_id, patch))
    }

    fn lock_job(&self, job_id: JobId) -> Result<Option<JobLock>, JobStoreError> {
        let conn = self.handle.block_on(self.try_advisory_lock(job_id))?;
        Ok(conn.map(|conn| {
            let lease = AdvisoryLease {
                conn: Some(conn),
                key: job_id.get(),
                handle: self.handle.clone(),
            };
            JobLock::new(job_id, lease)
        }))
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Storage(format!("failed to decode job row: {e}"));

    let status: String = row.try_get("status").map_err(decode)?;
    let status = parse_status(&status)?;
    let retries: i32 = row.try_get("retries").map_err(decode)?;
    let Json(payload): Json<JobPayload> = row.try_get("payload").map_err(decode)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(decode)?;

    Ok(Job {
        id: JobId::new(row.try_get("id").map_err(decode)?),
        job_type: row.try_get("job_type").map_err(decode)?,
        payload,
        status,
        retries: u32::try_from(retries).unwrap_or(0),
        result: row.try_get::<Option<JsonValue>, _>("result").map_err(decode)?,
        error_message: row
            .try_get::<Option<JsonValue>, _>("error_message")
            .map_err(decode)?,
        created_at,
        updated_at,
    })
}

fn parse_status(raw: &str) -> Result<JobStatus, JobStoreError> {
    raw.parse::<JobStatus>()
        .map_err(|e| JobStoreError::Storage(e.to_string()))
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => JobStoreError::Storage(format!("check constraint violated: {msg}")),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::Io(e) => JobStoreError::Unavailable(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => JobStoreError::Unavailable(format!("tls error in {}: {}", operation, e)),
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
