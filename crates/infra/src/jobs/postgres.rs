//! Postgres-backed job store.
//!
//! The queue relies on two storage capabilities: `FOR UPDATE SKIP LOCKED`
//! row selection and a per-transaction idle timeout
//! (`idle_in_transaction_session_timeout`, set with `set_config(.., true)` so
//! it only lives as long as the claim transaction).
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) on insert | `23505` | `AlreadyExists(key)` |
//! | Database (integrity violation) | `23xxx` | `Constraint` |
//! | Database (other) | Any other | `Unavailable` |
//! | PoolClosed / PoolTimedOut / Io / Tls | N/A | `Unavailable` |
//! | Row decoding | N/A | `Unavailable` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use leaseq_core::{Job, JobKey, JobKind, JobStatus, RawJob};

use super::store::{ClaimOrder, ClaimTx, JobStats, JobStore, JobStoreError, OnConflict};

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS job (
        subject_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        created TIMESTAMPTZ NOT NULL,
        updated TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (subject_id, kind)
    )
"#;

const CREATE_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS job_status_created_idx ON job (status, created)";

const SELECT_NEWEST_NEW: &str = r#"
    SELECT subject_id, kind, status, created, updated
    FROM job
    WHERE status = $1 AND kind = ANY($2) AND subject_id <> ''
    ORDER BY created DESC
    LIMIT 1
    FOR UPDATE SKIP LOCKED
"#;

const SELECT_OLDEST_NEW: &str = r#"
    SELECT subject_id, kind, status, created, updated
    FROM job
    WHERE status = $1 AND kind = ANY($2) AND subject_id <> ''
    ORDER BY created ASC
    LIMIT 1
    FOR UPDATE SKIP LOCKED
"#;

/// Postgres-backed job store.
///
/// `Send + Sync`; clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect a pool of at most `max_connections` to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begin a transaction whose session is killed after `idle_timeout`
    /// idle inside it. The setting is transaction-local.
    async fn open_claim(&self, idle_timeout: Duration) -> Result<PgClaimTx, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT set_config('idle_in_transaction_session_timeout', $1, true)")
            .bind(format!("{}ms", idle_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_idle_timeout", e))?;

        Ok(PgClaimTx { tx })
    }

    /// Create the `job` table and its claim index if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::query(CREATE_TABLE)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_table", e))?;
        sqlx::query(CREATE_STATUS_INDEX)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_index", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, jobs), fields(batch = jobs.len(), inserted = tracing::field::Empty), err)]
    async fn insert_jobs(
        &self,
        jobs: &[Job],
        on_conflict: OnConflict,
    ) -> Result<Vec<JobKey>, JobStoreError> {
        if jobs.is_empty() {
            return Ok(vec![]);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let statement = match on_conflict {
            OnConflict::Fail => {
                "INSERT INTO job (subject_id, kind, status, created, updated) VALUES ($1, $2, $3, $4, $5)"
            }
            OnConflict::Skip => {
                "INSERT INTO job (subject_id, kind, status, created, updated) VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (subject_id, kind) DO NOTHING"
            }
        };

        let mut inserted = Vec::with_capacity(jobs.len());
        for job in jobs {
            // An error drops `tx`, rolling back every row of the batch.
            let result = sqlx::query(statement)
                .bind(job.subject_id.as_str())
                .bind(job.kind.as_str())
                .bind(job.status.as_str())
                .bind(job.created)
                .bind(job.updated)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        JobStoreError::AlreadyExists(job.key())
                    } else {
                        map_sqlx_error("insert_job", e)
                    }
                })?;
            if result.rows_affected() == 1 {
                inserted.push(job.key());
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Span::current().record("inserted", inserted.len());
        Ok(inserted)
    }

    #[instrument(skip(self, job), fields(job = %job.key(), status = %job.status), err)]
    async fn update_job(&self, job: &Job, expected: JobStatus) -> Result<u64, JobStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        update_status(&mut conn, job, expected).await
    }

    #[instrument(skip(self, job), fields(job = %job.key(), status = %job.status), err)]
    async fn update_lease(&self, job: &Job, lease: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job
            SET status = $3, updated = $4
            WHERE subject_id = $1 AND kind = $2 AND status = $5 AND updated = $6
            "#,
        )
        .bind(job.subject_id.as_str())
        .bind(job.kind.as_str())
        .bind(job.status.as_str())
        .bind(job.updated)
        .bind(JobStatus::InProgress.as_str())
        .bind(lease)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_lease", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn begin_claim(&self, idle_timeout: Duration) -> Result<Box<dyn ClaimTx>, JobStoreError> {
        Ok(Box::new(self.open_claim(idle_timeout).await?))
    }

    #[instrument(skip(self), fields(count = tracing::field::Empty), err)]
    async fn reset_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RawJob>, JobStoreError> {
        // A single UPDATE is its own transaction.
        let rows = sqlx::query(
            r#"
            UPDATE job
            SET status = $3, updated = $2
            WHERE status = $4 AND updated < $1
            RETURNING subject_id, kind, status, created, updated
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .bind(JobStatus::New.as_str())
        .bind(JobStatus::InProgress.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_stale", e))?;

        let reset = decode_rows(&rows)?;
        Span::current().record("count", reset.len());
        Ok(reset)
    }

    #[instrument(skip(self, key), fields(job = %key), err)]
    async fn get(&self, key: &JobKey) -> Result<Option<RawJob>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT subject_id, kind, status, created, updated
            FROM job
            WHERE subject_id = $1 AND kind = $2
            "#,
        )
        .bind(key.subject_id.as_str())
        .bind(key.kind.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref()
            .map(|r| JobRow::from_row(r).map(RawJob::from))
            .transpose()
            .map_err(|e| map_sqlx_error("decode_row", e))
    }

    #[instrument(skip(self), err)]
    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<RawJob>, JobStoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT subject_id, kind, status, created, updated
            FROM job
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created DESC
            LIMIT $2
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        decode_rows(&rows)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM job GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("decode_row", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("decode_row", e))?;
            stats.add(&status, n.max(0) as u64);
        }
        Ok(stats)
    }
}

/// Claim transaction holding the skip-locked row lock.
///
/// Dropping it rolls back (sqlx `Transaction` semantics).
struct PgClaimTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ClaimTx for PgClaimTx {
    async fn select_next_new(
        &mut self,
        order: ClaimOrder,
        kinds: &[JobKind],
    ) -> Result<Option<RawJob>, JobStoreError> {
        let statement = match order {
            ClaimOrder::NewestFirst => SELECT_NEWEST_NEW,
            ClaimOrder::OldestFirst => SELECT_OLDEST_NEW,
        };
        let kinds: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();

        let row = sqlx::query(statement)
            .bind(JobStatus::New.as_str())
            .bind(kinds)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("select_next_new", e))?;

        row.as_ref()
            .map(|r| JobRow::from_row(r).map(RawJob::from))
            .transpose()
            .map_err(|e| map_sqlx_error("decode_row", e))
    }

    async fn update_job(&mut self, job: &Job, expected: JobStatus) -> Result<u64, JobStoreError> {
        update_status(&mut self.tx, job, expected).await
    }

    async fn commit(self: Box<Self>) -> Result<(), JobStoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), JobStoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

async fn update_status(
    conn: &mut PgConnection,
    job: &Job,
    expected: JobStatus,
) -> Result<u64, JobStoreError> {
    let result = sqlx::query(
        r#"
        UPDATE job
        SET status = $3, updated = $4
        WHERE subject_id = $1 AND kind = $2 AND status = $5
        "#,
    )
    .bind(job.subject_id.as_str())
    .bind(job.kind.as_str())
    .bind(job.status.as_str())
    .bind(job.updated)
    .bind(expected.as_str())
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("update_job", e))?;

    Ok(result.rows_affected())
}

fn decode_rows(rows: &[sqlx::postgres::PgRow]) -> Result<Vec<RawJob>, JobStoreError> {
    rows.iter()
        .map(|row| JobRow::from_row(row).map(RawJob::from))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| map_sqlx_error("decode_row", e))
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                // Class 23: integrity constraint violation.
                Some(code) if code.starts_with("23") => JobStoreError::Constraint(msg),
                _ => JobStoreError::Unavailable(msg),
            }
        }
        other => JobStoreError::Unavailable(format!("{} failed: {}", operation, other)),
    }
}

/// Check if a SQLx error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    subject_id: String,
    kind: String,
    status: String,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            subject_id: row.try_get("subject_id")?,
            kind: row.try_get("kind")?,
            status: row.try_get("status")?,
            created: row.try_get("created")?,
            updated: row.try_get("updated")?,
        })
    }
}

impl From<JobRow> for RawJob {
    fn from(row: JobRow) -> Self {
        RawJob {
            subject_id: row.subject_id,
            kind: row.kind,
            status: row.status,
            created: row.created,
            updated: row.updated,
        }
    }
}
