//! SQLite-backed job store.
//!
//! One database file holds three tables: `jobs` (active), `dlq` (dead
//! letters) and `config` (queue settings and the worker stop flag). Several
//! processes may open the same file; SQLite's locking (WAL journal + busy
//! timeout) serializes writers, and every transition is written as a
//! conditional statement so that losing a race shows up as zero affected rows.
//!
//! ## Claim protocol
//!
//! 1. Read a small batch of eligible candidates (no lock held)
//! 2. For each candidate, issue `UPDATE … WHERE id = ? AND state = <seen> AND
//!    owner IS NULL` (or `AND owner = <seen owner> AND lease_expires_at < now`
//!    for an expired lease)
//! 3. The first update that affects one row wins; zero rows means another
//!    worker got there first and the next candidate is tried
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database (unique violation on insert) | `DuplicateId` |
//! | Database (busy, locked, I/O, ...) | `Unavailable` |
//! | Decode / ColumnDecode / ColumnNotFound | `Corrupt` |
//! | PoolClosed / PoolTimedOut / Io / other | `Unavailable` |
//!
//! Timestamps are stored as integer milliseconds since the Unix epoch.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{FromRow, Sqlite};
use tracing::{debug, instrument};

use queuectl_core::{
    Clock, DeadLetterEntry, FailureOutcome, Job, JobId, JobState, SystemClock, WorkerId,
};

use crate::config::{QueueSettings, STOP_FLAG_KEY, SettingKey};

use super::store::{JobFilter, JobStats, JobStore, StoreError, lease_deadline};

/// How long a connection waits for another process's write lock.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Candidates read per claim round.
const CLAIM_BATCH: i64 = 8;

/// Claim rounds before giving up for this poll cycle (all candidates lost).
const CLAIM_ROUNDS: usize = 4;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id               TEXT PRIMARY KEY,
        command          TEXT NOT NULL,
        state            TEXT NOT NULL
                         CHECK (state IN ('pending', 'processing', 'completed', 'failed')),
        attempts         INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        max_retries      INTEGER NOT NULL CHECK (max_retries >= 0),
        next_attempt_at  INTEGER NOT NULL,
        owner            TEXT NULL,
        lease_expires_at INTEGER NULL,
        created_at       INTEGER NOT NULL,
        updated_at       INTEGER NOT NULL,
        last_error       TEXT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_claim_order
        ON jobs (state, next_attempt_at, id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dlq (
        id               TEXT PRIMARY KEY,
        command          TEXT NOT NULL,
        state            TEXT NOT NULL CHECK (state = 'dead'),
        attempts         INTEGER NOT NULL,
        max_retries      INTEGER NOT NULL,
        next_attempt_at  INTEGER NOT NULL,
        owner            TEXT NULL,
        lease_expires_at INTEGER NULL,
        created_at       INTEGER NOT NULL,
        updated_at       INTEGER NOT NULL,
        last_error       TEXT NULL,
        moved_at         INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS config (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
];

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, next_attempt_at, \
                           owner, lease_expires_at, created_at, updated_at, last_error";

const INSERT_JOB: &str = r#"
    INSERT INTO jobs (
        id, command, state, attempts, max_retries, next_attempt_at,
        owner, lease_expires_at, created_at, updated_at, last_error
    )
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
"#;

const INSERT_DEAD_LETTER: &str = r#"
    INSERT INTO dlq (
        id, command, state, attempts, max_retries, next_attempt_at,
        owner, lease_expires_at, created_at, updated_at, last_error, moved_at
    )
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
"#;

/// SQLite job store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteJobStore {
    /// Open (creating if needed) the database file and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("open", e))?;

        debug!(path = %path.display(), "opened job store");
        Self::from_pool(pool).await
    }

    /// Private in-memory database (single connection), for tests and demos.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| map_sqlx_error("open_in_memory", e))?;

        // Every connection to `:memory:` is a separate database: keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("open_in_memory", e))?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and apply the schema.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            clock: Arc::new(SystemClock),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Replace the time source (tests inject a `ManualClock`).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Flush and close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }

        for (key, value) in QueueSettings::default().to_pairs() {
            sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)")
                .bind(key.as_str())
                .bind(value)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("seed_config", e))?;
        }
        Ok(())
    }

    /// Classify a report that matched no row.
    async fn lease_miss(&self, id: &JobId, worker: WorkerId) -> StoreError {
        let exists = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT EXISTS (SELECT 1 FROM jobs WHERE id = ?1)
                OR EXISTS (SELECT 1 FROM dlq WHERE id = ?1)
            "#,
        )
        .bind(id.as_str())
        .fetch_one(&self.pool)
        .await;

        match exists {
            Ok(0) => StoreError::NotFound(id.clone()),
            Ok(_) => StoreError::LeaseLost {
                id: id.clone(),
                worker,
            },
            Err(e) => map_sqlx_error("lease_miss", e),
        }
    }

    async fn upsert_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO config (key, value) VALUES (?1, ?2)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_config", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    #[instrument(level = "debug", skip(self, job), fields(job_id = %job.id))]
    async fn insert(&self, job: Job) -> Result<Job, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Write first so the transaction holds the write lock from the start.
        if let Err(e) = bind_job(sqlx::query(INSERT_JOB), &job)
            .execute(&mut *tx)
            .await
        {
            return Err(if is_unique_violation(&e) {
                StoreError::DuplicateId(job.id)
            } else {
                map_sqlx_error("insert_job", e)
            });
        }

        let in_dlq = sqlx::query("SELECT 1 FROM dlq WHERE id = ?1")
            .bind(job.id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("check_dlq", e))?
            .is_some();

        if in_dlq {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::DuplicateId(job.id));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(Job::try_from).transpose()
    }

    #[instrument(level = "debug", skip(self))]
    async fn claim_next(
        &self,
        worker: WorkerId,
        lease_duration: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let now = self.now();
        let now_ms = to_millis(now);
        let deadline = lease_deadline(now, lease_duration)?;
        let worker_text = worker.to_string();

        let candidates_sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE (state IN ('pending', 'failed') AND next_attempt_at <= ?1)
               OR (state = 'processing' AND lease_expires_at < ?1)
            ORDER BY next_attempt_at ASC, id ASC
            LIMIT ?2
            "#
        );

        for _ in 0..CLAIM_ROUNDS {
            let rows = sqlx::query_as::<_, JobRow>(&candidates_sql)
                .bind(now_ms)
                .bind(CLAIM_BATCH)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("claim_candidates", e))?;

            if rows.is_empty() {
                return Ok(None);
            }

            for row in rows {
                let mut job = Job::try_from(row)?;

                let claimed = if job.state == JobState::Processing {
                    // Expired lease: compare-and-swap on the previous owner.
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET owner = ?1, lease_expires_at = ?2, updated_at = ?3
                        WHERE id = ?4
                          AND state = 'processing'
                          AND owner = ?5
                          AND lease_expires_at < ?3
                        "#,
                    )
                    .bind(&worker_text)
                    .bind(to_millis(deadline))
                    .bind(now_ms)
                    .bind(job.id.as_str())
                    .bind(job.owner.map(|o| o.to_string()))
                    .execute(&self.pool)
                    .await
                } else {
                    sqlx::query(
                        r#"
                        UPDATE jobs
                        SET state = 'processing', owner = ?1, lease_expires_at = ?2, updated_at = ?3
                        WHERE id = ?4
                          AND state = ?5
                          AND owner IS NULL
                          AND next_attempt_at <= ?3
                        "#,
                    )
                    .bind(&worker_text)
                    .bind(to_millis(deadline))
                    .bind(now_ms)
                    .bind(job.id.as_str())
                    .bind(job.state.as_str())
                    .execute(&self.pool)
                    .await
                }
                .map_err(|e| map_sqlx_error("claim_job", e))?;

                if claimed.rows_affected() == 1 {
                    let reclaimed = job.state == JobState::Processing;
                    job.claim(worker, deadline, now)?;
                    debug!(job_id = %job.id, reclaimed, attempts = job.attempts, "claimed job");
                    return Ok(Some(job));
                }

                debug!(job_id = %job.id, "lost claim race; trying next candidate");
            }
        }

        Ok(None)
    }

    #[instrument(level = "debug", skip(self))]
    async fn mark_completed(&self, id: &JobId, worker: WorkerId) -> Result<Job, StoreError> {
        let now_ms = to_millis(self.now());

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed',
                owner = NULL,
                lease_expires_at = NULL,
                last_error = NULL,
                updated_at = ?1
            WHERE id = ?2
              AND state = 'processing'
              AND owner = ?3
            "#,
        )
        .bind(now_ms)
        .bind(id.as_str())
        .bind(worker.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_completed", e))?;

        if result.rows_affected() == 0 {
            return Err(self.lease_miss(id, worker).await);
        }

        self.get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    #[instrument(level = "debug", skip(self, error))]
    async fn mark_failed(
        &self,
        id: &JobId,
        worker: WorkerId,
        error: &str,
    ) -> Result<FailureOutcome, StoreError> {
        let now = self.now();
        let now_ms = to_millis(now);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Conditional write first: takes the write lock and checks the lease in one step.
        let locked = sqlx::query(
            r#"
            UPDATE jobs
            SET updated_at = ?1
            WHERE id = ?2
              AND state = 'processing'
              AND owner = ?3
            "#,
        )
        .bind(now_ms)
        .bind(id.as_str())
        .bind(worker.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?;

        if locked.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(self.lease_miss(id, worker).await);
        }

        let settings = load_settings(&mut *tx).await?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("load_job", e))?;

        let mut job = Job::try_from(row)?;
        let outcome = job.fail(worker, error, now, &settings.backoff())?;

        match outcome {
            FailureOutcome::DeadLettered { .. } => {
                let entry = DeadLetterEntry::new(job, now);
                bind_job(sqlx::query(INSERT_DEAD_LETTER), &entry.job)
                    .bind(to_millis(entry.moved_at))
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        if is_unique_violation(&e) {
                            StoreError::Corrupt(format!("job {id} is already in the DLQ"))
                        } else {
                            map_sqlx_error("insert_dead_letter", e)
                        }
                    })?;

                sqlx::query("DELETE FROM jobs WHERE id = ?1")
                    .bind(id.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("delete_job", e))?;
            }
            FailureOutcome::RetryScheduled {
                attempts,
                next_attempt_at,
            } => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'failed',
                        attempts = ?1,
                        next_attempt_at = ?2,
                        owner = NULL,
                        lease_expires_at = NULL,
                        last_error = ?3,
                        updated_at = ?4
                    WHERE id = ?5
                    "#,
                )
                .bind(i64::from(attempts))
                .bind(to_millis(next_attempt_at))
                .bind(error)
                .bind(now_ms)
                .bind(id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("schedule_retry", e))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(outcome)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE (?1 IS NULL OR state = ?1)
            ORDER BY next_attempt_at ASC, id ASC
            LIMIT ?2
            "#
        );
        // SQLite treats a negative LIMIT as "no limit".
        let limit = filter
            .limit
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
            .unwrap_or(-1);

        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(filter.state.map(|s| s.as_str()))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn stats(&self) -> Result<JobStats, StoreError> {
        let now_ms = to_millis(self.now());

        let rows = sqlx::query_as::<_, (String, i64, i64)>(
            r#"
            SELECT state,
                   COUNT(*) AS total,
                   COALESCE(SUM(CASE WHEN next_attempt_at <= ?1 THEN 1 ELSE 0 END), 0) AS ready
            FROM jobs
            GROUP BY state
            "#,
        )
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for (state, total, ready) in rows {
            let state: JobState = state.parse()?;
            let total = usize::try_from(total).unwrap_or(0);
            let ready = usize::try_from(ready).unwrap_or(0);
            match state {
                JobState::Pending => stats.pending = total,
                JobState::Processing => stats.processing = total,
                JobState::Completed => stats.completed = total,
                JobState::Failed => stats.failed = total,
                JobState::Dead => {}
            }
            if state.is_waiting() {
                stats.ready += ready;
                stats.delayed += total.saturating_sub(ready);
            }
        }

        let dead = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM dlq")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_dlq", e))?;
        stats.dead = usize::try_from(dead).unwrap_or(0);

        Ok(stats)
    }

    async fn dlq_list(&self) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS}, moved_at FROM dlq ORDER BY moved_at ASC, id ASC");
        let rows = sqlx::query_as::<_, DeadLetterRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("dlq_list", e))?;

        rows.into_iter().map(DeadLetterEntry::try_from).collect()
    }

    async fn dlq_get(&self, id: &JobId) -> Result<Option<DeadLetterEntry>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS}, moved_at FROM dlq WHERE id = ?1");
        let row = sqlx::query_as::<_, DeadLetterRow>(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("dlq_get", e))?;

        row.map(DeadLetterEntry::try_from).transpose()
    }

    #[instrument(level = "debug", skip(self, command))]
    async fn dlq_requeue(&self, id: &JobId, command: Option<String>) -> Result<Job, StoreError> {
        let now = self.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let sql = format!("DELETE FROM dlq WHERE id = ?1 RETURNING {JOB_COLUMNS}, moved_at");
        let row = sqlx::query_as::<_, DeadLetterRow>(&sql)
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("take_dead_letter", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::NotFound(id.clone()));
        };

        let entry = DeadLetterEntry::try_from(row)?;
        let job = entry.to_requeued(command, now);

        if let Err(e) = bind_job(sqlx::query(INSERT_JOB), &job)
            .execute(&mut *tx)
            .await
        {
            return Err(if is_unique_violation(&e) {
                StoreError::DuplicateId(id.clone())
            } else {
                map_sqlx_error("requeue_job", e)
            });
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    async fn dlq_delete(&self, id: &JobId) -> Result<DeadLetterEntry, StoreError> {
        let sql = format!("DELETE FROM dlq WHERE id = ?1 RETURNING {JOB_COLUMNS}, moved_at");
        let row = sqlx::query_as::<_, DeadLetterRow>(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("dlq_delete", e))?;

        match row {
            Some(row) => DeadLetterEntry::try_from(row),
            None => Err(StoreError::NotFound(id.clone())),
        }
    }

    async fn settings(&self) -> Result<QueueSettings, StoreError> {
        load_settings(&self.pool).await
    }

    async fn set_setting(&self, key: SettingKey, value: &str) -> Result<QueueSettings, StoreError> {
        let mut settings = self.settings().await?;
        settings.apply(key, value)?;
        self.upsert_config(key.as_str(), &settings.get(key)).await?;
        Ok(settings)
    }

    async fn stop_requested(&self) -> Result<bool, StoreError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM config WHERE key = ?1")
            .bind(STOP_FLAG_KEY)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("stop_requested", e))?;

        Ok(value.as_deref() == Some("1"))
    }

    async fn set_stop_requested(&self, stop: bool) -> Result<(), StoreError> {
        self.upsert_config(STOP_FLAG_KEY, if stop { "1" } else { "0" })
            .await
    }
}

async fn load_settings<'e, E>(executor: E) -> Result<QueueSettings, StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query_as::<_, (String, String)>("SELECT key, value FROM config")
        .fetch_all(executor)
        .await
        .map_err(|e| map_sqlx_error("load_settings", e))?;

    Ok(QueueSettings::from_pairs(
        rows.iter().map(|(k, v)| (k.as_str(), v.as_str())),
    )?)
}

fn bind_job<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    job: &Job,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    query
        .bind(job.id.to_string())
        .bind(job.command.clone())
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_retries))
        .bind(to_millis(job.next_attempt_at))
        .bind(job.owner.map(|o| o.to_string()))
        .bind(job.lease_expires_at.map(to_millis))
        .bind(to_millis(job.created_at))
        .bind(to_millis(job.updated_at))
        .bind(job.last_error.clone())
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(column: &str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("{column} out of range: {ms}")))
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Unavailable(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        e @ (sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::RowNotFound) => {
            StoreError::Corrupt(format!("unreadable row in {operation}: {e}"))
        }
        other => StoreError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

// SQLx row types

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    command: String,
    state: String,
    attempts: i64,
    max_retries: i64,
    next_attempt_at: i64,
    owner: Option<String>,
    lease_expires_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
    last_error: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |column: &str, detail: String| {
            StoreError::Corrupt(format!("job {}: invalid {column}: {detail}", row.id))
        };

        let id = JobId::parse(row.id.clone()).map_err(|e| corrupt("id", e.to_string()))?;
        let state = row
            .state
            .parse::<JobState>()
            .map_err(|e| corrupt("state", e.to_string()))?;
        let attempts =
            u32::try_from(row.attempts).map_err(|e| corrupt("attempts", e.to_string()))?;
        let max_retries =
            u32::try_from(row.max_retries).map_err(|e| corrupt("max_retries", e.to_string()))?;
        let owner = row
            .owner
            .as_deref()
            .map(WorkerId::from_str)
            .transpose()
            .map_err(|e| corrupt("owner", e.to_string()))?;

        Ok(Job {
            id,
            command: row.command,
            state,
            attempts,
            max_retries,
            next_attempt_at: from_millis("next_attempt_at", row.next_attempt_at)?,
            owner,
            lease_expires_at: row
                .lease_expires_at
                .map(|ms| from_millis("lease_expires_at", ms))
                .transpose()?,
            created_at: from_millis("created_at", row.created_at)?,
            updated_at: from_millis("updated_at", row.updated_at)?,
            last_error: row.last_error,
        })
    }
}

#[derive(Debug, FromRow)]
struct DeadLetterRow {
    #[sqlx(flatten)]
    job: JobRow,
    moved_at: i64,
}

impl TryFrom<DeadLetterRow> for DeadLetterEntry {
    type Error = StoreError;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        Ok(DeadLetterEntry {
            job: Job::try_from(row.job)?,
            moved_at: from_millis("moved_at", row.moved_at)?,
        })
    }
}
