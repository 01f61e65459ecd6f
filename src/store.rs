//! SQLite-backed persistence for jobs, the dead letter queue, the worker
//! registry, and configuration.
//!
//! All mutations run inside transactions on a WAL-mode database so that N
//! worker processes can share one file. The claim path is the only
//! coordination point between workers: it runs a `BEGIN IMMEDIATE`
//! transaction whose conditional update makes the pending->processing
//! transition atomic — under concurrent claimants at most one observes a
//! rowcount of 1 for any given job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::models::{truncate_error, DlqEntry, Job, JobState, WorkerRecord};

const SCHEMA_VERSION: i64 = 1;

/// Retries for write transactions that hit lock contention after the busy
/// timeout, before the error surfaces as `QueueError::Store`.
const BUSY_RETRIES: u32 = 3;
const BUSY_RETRY_DELAY_MS: u64 = 50;

pub fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn map_store_err(context: &str, err: impl std::fmt::Display) -> QueueError {
    QueueError::Store(format!("{}: {}", context, err))
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

fn is_constraint(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// Per-state job counts plus the DLQ depth, as shown by `status`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
    pub dlq: u64,
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| map_store_err("create database directory", e))?;
            }
        }
        let conn = Connection::open(&db_path).map_err(|e| map_store_err("open database", e))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        };
        store.configure_connection()?;
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn configure_connection(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| map_store_err("set journal_mode", e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| map_store_err("set synchronous", e))?;
        conn.busy_timeout(Duration::from_secs(30))
            .map_err(|e| map_store_err("set busy_timeout", e))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| QueueError::Store("store lock poisoned".to_string()))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                 version INTEGER PRIMARY KEY,
                 name TEXT NOT NULL,
                 applied_at_ms INTEGER NOT NULL
             )",
            [],
        )
        .map_err(|e| map_store_err("create schema_migrations", e))?;

        let current: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .map_err(|e| map_store_err("read schema version", e))?;
        if current > SCHEMA_VERSION {
            return Err(QueueError::Store(format!(
                "database schema version {} is newer than supported {}",
                current, SCHEMA_VERSION
            )));
        }
        if current < 1 {
            apply_migration_v1(&conn)?;
            record_migration(&conn, 1, "baseline_queue_tables")?;
        }
        Ok(())
    }

    /// Run a write closure, retrying a bounded number of times when the
    /// database is locked by another process beyond the busy timeout.
    fn with_write<T>(
        &self,
        context: &str,
        mut op: impl FnMut(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock()?;
        let mut attempt = 0;
        loop {
            match op(&mut conn) {
                Ok(value) => return Ok(value),
                Err(err) if is_busy(&err) && attempt < BUSY_RETRIES => {
                    attempt += 1;
                    std::thread::sleep(Duration::from_millis(
                        BUSY_RETRY_DELAY_MS * u64::from(attempt),
                    ));
                }
                Err(err) => return Err(map_store_err(context, err)),
            }
        }
    }

    // ── Jobs ────────────────────────────────────────────────────────────

    pub fn enqueue(&self, job: &Job) -> Result<String> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO jobs (id, command, state, priority, max_retries, attempts,
                               timeout_seconds, run_at, next_run_at, worker_id,
                               created_at, updated_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10, ?11, NULL)",
            params![
                job.id,
                job.command,
                job.state.as_str(),
                job.priority,
                job.max_retries,
                job.attempts,
                job.timeout_seconds,
                job.run_at.map(dt_to_ms),
                dt_to_ms(job.next_run_at),
                dt_to_ms(job.created_at),
                dt_to_ms(job.updated_at),
            ],
        );
        match inserted {
            Ok(_) => Ok(job.id.clone()),
            Err(err) if is_constraint(&err) => Err(QueueError::DuplicateId(job.id.clone())),
            Err(err) => Err(map_store_err("enqueue job", err)),
        }
    }

    /// Atomically claim the highest-priority eligible job for `worker_id`.
    ///
    /// Selection and transition happen inside one immediate transaction;
    /// the update re-checks `state='pending' AND next_run_at <= now` so a
    /// row claimed by a racing worker yields a rowcount of 0 and `None`.
    pub fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        self.with_write("claim job", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now_ms = dt_to_ms(now);
            let candidate: Option<String> = tx
                .query_row(
                    "SELECT id FROM jobs
                     WHERE state = 'pending' AND next_run_at <= ?1
                     ORDER BY priority DESC, created_at ASC, id ASC
                     LIMIT 1",
                    params![now_ms],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(job_id) = candidate else {
                return Ok(None);
            };
            let updated = tx.execute(
                "UPDATE jobs
                 SET state = 'processing', worker_id = ?2, updated_at = ?3
                 WHERE id = ?1 AND state = 'pending' AND next_run_at <= ?3",
                params![job_id, worker_id, now_ms],
            )?;
            if updated != 1 {
                return Ok(None);
            }
            let job = get_job_tx(&tx, &job_id)?;
            tx.commit()?;
            Ok(job)
        })
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let conn = self.lock()?;
        get_job_tx(&conn, job_id).map_err(|e| map_store_err("read job", e))
    }

    /// processing -> completed. Returns false if the job was not processing
    /// (e.g. already released by orphan recovery).
    pub fn complete(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE jobs
                 SET state = 'completed', worker_id = NULL, updated_at = ?2
                 WHERE id = ?1 AND state = 'processing'",
                params![job_id, dt_to_ms(now)],
            )
            .map_err(|e| map_store_err("complete job", e))?;
        Ok(updated == 1)
    }

    /// processing -> pending with the consumed attempt recorded and the next
    /// eligibility pushed out by the caller-computed backoff.
    pub fn fail_and_retry(
        &self,
        job_id: &str,
        error: &str,
        attempts: u32,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE jobs
                 SET state = 'pending', worker_id = NULL, attempts = ?2,
                     last_error = ?3, next_run_at = ?4, updated_at = ?5
                 WHERE id = ?1 AND state = 'processing'",
                params![
                    job_id,
                    attempts,
                    truncate_error(error),
                    dt_to_ms(next_run_at),
                    dt_to_ms(now),
                ],
            )
            .map_err(|e| map_store_err("schedule retry", e))?;
        Ok(updated == 1)
    }

    /// processing -> dead plus the DLQ insert, in one transaction. Returns
    /// the new DLQ id, or `None` if the job was no longer processing.
    pub fn fail_and_deadletter(
        &self,
        job: &Job,
        error: &str,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        let last_error = truncate_error(error);
        self.with_write("move job to dlq", |conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE jobs
                 SET state = 'dead', worker_id = NULL, attempts = ?2,
                     last_error = ?3, updated_at = ?4
                 WHERE id = ?1 AND state = 'processing'",
                params![job.id, attempts, last_error, dt_to_ms(now)],
            )?;
            if updated != 1 {
                return Ok(None);
            }
            let dlq_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO dlq (dlq_id, original_job_id, command, attempts,
                                  last_error, created_at, moved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    dlq_id,
                    job.id,
                    job.command,
                    attempts,
                    last_error,
                    dt_to_ms(job.created_at),
                    dt_to_ms(now),
                ],
            )?;
            tx.commit()?;
            Ok(Some(dlq_id))
        })
    }

    pub fn list_jobs(
        &self,
        state: Option<JobState>,
        since: Option<DateTime<Utc>>,
        sort: &str,
        limit: u32,
    ) -> Result<Vec<Job>> {
        let order = match sort {
            "created_at" => "created_at DESC",
            "updated_at" => "updated_at DESC",
            "priority" => "priority DESC, created_at ASC",
            other => {
                return Err(QueueError::Validation(format!(
                    "unknown sort field '{}'. expected one of: created_at, updated_at, priority",
                    other
                )))
            }
        };
        let mut sql = String::from(
            "SELECT id, command, state, priority, max_retries, attempts, timeout_seconds,
                    run_at, next_run_at, worker_id, created_at, updated_at, last_error
             FROM jobs",
        );
        let mut clauses: Vec<&str> = Vec::new();
        let mut bound: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(state) = state {
            clauses.push("state = ?");
            bound.push(state.as_str().to_string().into());
        }
        if let Some(since) = since {
            clauses.push("created_at >= ?");
            bound.push(dt_to_ms(since).into());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY {} LIMIT ?", order));
        bound.push(i64::from(limit).into());

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| map_store_err("prepare list jobs", e))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(bound), map_job_row)
            .map_err(|e| map_store_err("list jobs", e))?;
        collect_rows(rows, "list jobs")
    }

    pub fn job_counts(&self) -> Result<QueueCounts> {
        let conn = self.lock()?;
        let mut counts = QueueCounts::default();
        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")
            .map_err(|e| map_store_err("prepare job counts", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| map_store_err("count jobs", e))?;
        for row in rows {
            let (state, count) = row.map_err(|e| map_store_err("count jobs", e))?;
            let count = count as u64;
            match state.as_str() {
                "pending" => counts.pending = count,
                "processing" => counts.processing = count,
                "completed" => counts.completed = count,
                "failed" => counts.failed = count,
                "dead" => counts.dead = count,
                _ => {}
            }
        }
        counts.dlq = conn
            .query_row("SELECT COUNT(*) FROM dlq", [], |row| row.get::<_, i64>(0))
            .map_err(|e| map_store_err("count dlq", e))? as u64;
        Ok(counts)
    }

    /// Most recently updated jobs that carry a failure message.
    pub fn recent_failures(&self, limit: u32) -> Result<Vec<Job>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, command, state, priority, max_retries, attempts, timeout_seconds,
                        run_at, next_run_at, worker_id, created_at, updated_at, last_error
                 FROM jobs
                 WHERE last_error IS NOT NULL
                 ORDER BY updated_at DESC
                 LIMIT ?1",
            )
            .map_err(|e| map_store_err("prepare recent failures", e))?;
        let rows = stmt
            .query_map(params![limit], map_job_row)
            .map_err(|e| map_store_err("recent failures", e))?;
        collect_rows(rows, "recent failures")
    }

    // ── Dead letter queue ───────────────────────────────────────────────

    pub fn list_dlq(&self, limit: u32) -> Result<Vec<DlqEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT dlq_id, original_job_id, command, attempts, last_error,
                        created_at, moved_at
                 FROM dlq
                 ORDER BY moved_at DESC
                 LIMIT ?1",
            )
            .map_err(|e| map_store_err("prepare list dlq", e))?;
        let rows = stmt
            .query_map(params![limit], map_dlq_row)
            .map_err(|e| map_store_err("list dlq", e))?;
        collect_rows(rows, "list dlq")
    }

    /// Atomically delete a DLQ entry and insert a fresh pending job.
    ///
    /// With `same_id` the new job reuses the original job id; otherwise a
    /// fresh id is generated. Either way attempts restart at 0.
    pub fn retry_dlq(
        &self,
        dlq_id: &str,
        same_id: bool,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let result = self.with_write("retry dlq entry", |conn| {
            let tx = conn.transaction()?;
            let entry = tx
                .query_row(
                    "SELECT dlq_id, original_job_id, command, attempts, last_error,
                            created_at, moved_at
                     FROM dlq WHERE dlq_id = ?1",
                    params![dlq_id],
                    map_dlq_row,
                )
                .optional()?;
            let Some(entry) = entry else {
                return Ok(Err(QueueError::NotFound(format!(
                    "DLQ entry '{}' not found",
                    dlq_id
                ))));
            };
            let new_job_id = if same_id {
                entry.original_job_id.clone()
            } else {
                Uuid::new_v4().to_string()
            };
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM jobs WHERE id = ?1",
                    params![new_job_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Ok(Err(QueueError::DuplicateId(new_job_id)));
            }
            tx.execute(
                "INSERT INTO jobs (id, command, state, priority, max_retries, attempts,
                                   timeout_seconds, run_at, next_run_at, worker_id,
                                   created_at, updated_at, last_error)
                 VALUES (?1, ?2, 'pending', 0, ?3, 0, NULL, NULL, ?4, NULL, ?5, ?4, NULL)",
                params![
                    new_job_id,
                    entry.command,
                    max_retries,
                    dt_to_ms(now),
                    dt_to_ms(entry.created_at),
                ],
            )?;
            tx.execute("DELETE FROM dlq WHERE dlq_id = ?1", params![dlq_id])?;
            tx.commit()?;
            Ok(Ok(new_job_id))
        })?;
        result
    }

    /// Delete DLQ entries, optionally only those older than the cutoff.
    pub fn purge_dlq(&self, older_than_days: Option<u32>, now: DateTime<Utc>) -> Result<u64> {
        let conn = self.lock()?;
        let purged = match older_than_days {
            Some(days) => {
                let cutoff = now - chrono::Duration::days(i64::from(days));
                conn.execute(
                    "DELETE FROM dlq WHERE moved_at < ?1",
                    params![dt_to_ms(cutoff)],
                )
            }
            None => conn.execute("DELETE FROM dlq", []),
        }
        .map_err(|e| map_store_err("purge dlq", e))?;
        Ok(purged as u64)
    }

    // ── Worker registry ─────────────────────────────────────────────────

    pub fn register_worker(&self, worker: &WorkerRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO workers (worker_id, pid, hostname, started_at, last_heartbeat_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(worker_id) DO UPDATE SET
                 pid = excluded.pid,
                 hostname = excluded.hostname,
                 started_at = excluded.started_at,
                 last_heartbeat_at = excluded.last_heartbeat_at",
            params![
                worker.worker_id,
                worker.pid,
                worker.hostname,
                dt_to_ms(worker.started_at),
                dt_to_ms(worker.last_heartbeat_at),
            ],
        )
        .map_err(|e| map_store_err("register worker", e))?;
        Ok(())
    }

    pub fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE workers SET last_heartbeat_at = ?2 WHERE worker_id = ?1",
                params![worker_id, dt_to_ms(now)],
            )
            .map_err(|e| map_store_err("worker heartbeat", e))?;
        Ok(updated == 1)
    }

    pub fn unregister_worker(&self, worker_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM workers WHERE worker_id = ?1",
            params![worker_id],
        )
        .map_err(|e| map_store_err("unregister worker", e))?;
        Ok(())
    }

    pub fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT worker_id, pid, hostname, started_at, last_heartbeat_at
                 FROM workers ORDER BY started_at ASC",
            )
            .map_err(|e| map_store_err("prepare list workers", e))?;
        let rows = stmt
            .query_map([], map_worker_row)
            .map_err(|e| map_store_err("list workers", e))?;
        collect_rows(rows, "list workers")
    }

    /// Workers whose last heartbeat is within the staleness threshold.
    pub fn live_workers(&self, now: DateTime<Utc>, timeout_seconds: u64) -> Result<Vec<WorkerRecord>> {
        let cutoff = now - chrono::Duration::seconds(timeout_seconds as i64);
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT worker_id, pid, hostname, started_at, last_heartbeat_at
                 FROM workers
                 WHERE last_heartbeat_at >= ?1
                 ORDER BY started_at ASC",
            )
            .map_err(|e| map_store_err("prepare live workers", e))?;
        let rows = stmt
            .query_map(params![dt_to_ms(cutoff)], map_worker_row)
            .map_err(|e| map_store_err("live workers", e))?;
        collect_rows(rows, "live workers")
    }

    /// Processing jobs whose worker is unregistered or strictly past the
    /// staleness threshold. Strict timestamp comparison only: a slow but
    /// heartbeating worker keeps its claims.
    pub fn find_orphaned_jobs(
        &self,
        now: DateTime<Utc>,
        timeout_seconds: u64,
    ) -> Result<Vec<Job>> {
        let cutoff = now - chrono::Duration::seconds(timeout_seconds as i64);
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT j.id, j.command, j.state, j.priority, j.max_retries, j.attempts,
                        j.timeout_seconds, j.run_at, j.next_run_at, j.worker_id,
                        j.created_at, j.updated_at, j.last_error
                 FROM jobs j
                 LEFT JOIN workers w ON j.worker_id = w.worker_id
                 WHERE j.state = 'processing'
                   AND (w.worker_id IS NULL OR w.last_heartbeat_at < ?1)",
            )
            .map_err(|e| map_store_err("prepare orphan scan", e))?;
        let rows = stmt
            .query_map(params![dt_to_ms(cutoff)], map_job_row)
            .map_err(|e| map_store_err("orphan scan", e))?;
        collect_rows(rows, "orphan scan")
    }

    // ── Config ──────────────────────────────────────────────────────────

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT value FROM config WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| map_store_err("read config", e))
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(|e| map_store_err("write config", e))?;
        Ok(())
    }

    pub fn stored_config(&self) -> Result<HashMap<String, String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT key, value FROM config")
            .map_err(|e| map_store_err("prepare read config", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| map_store_err("read config", e))?;
        let mut out = HashMap::new();
        for row in rows {
            let (key, value) = row.map_err(|e| map_store_err("read config", e))?;
            out.insert(key, value);
        }
        Ok(out)
    }

    /// Typed snapshot of the effective configuration.
    pub fn load_config(&self) -> Result<QueueConfig> {
        QueueConfig::from_entries(&self.stored_config()?)
    }
}

fn record_migration(conn: &Connection, version: i64, name: &str) -> Result<()> {
    // OR IGNORE: concurrent first-open of the same file may race here; the
    // schema statements themselves are idempotent.
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, name, applied_at_ms)
         VALUES (?1, ?2, ?3)",
        params![version, name, dt_to_ms(Utc::now())],
    )
    .map_err(|e| map_store_err("record migration", e))?;
    Ok(())
}

fn apply_migration_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS jobs (
             id TEXT PRIMARY KEY,
             command TEXT NOT NULL,
             state TEXT NOT NULL
                 CHECK (state IN ('pending', 'processing', 'completed', 'failed', 'dead')),
             priority INTEGER NOT NULL DEFAULT 0,
             max_retries INTEGER NOT NULL DEFAULT 3,
             attempts INTEGER NOT NULL DEFAULT 0,
             timeout_seconds INTEGER,
             run_at INTEGER,
             next_run_at INTEGER NOT NULL,
             worker_id TEXT,
             created_at INTEGER NOT NULL,
             updated_at INTEGER NOT NULL,
             last_error TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_jobs_state_next_run ON jobs(state, next_run_at);
         CREATE INDEX IF NOT EXISTS idx_jobs_priority ON jobs(priority DESC, created_at ASC);
         CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);

         CREATE TABLE IF NOT EXISTS dlq (
             dlq_id TEXT PRIMARY KEY,
             original_job_id TEXT NOT NULL,
             command TEXT NOT NULL,
             attempts INTEGER NOT NULL,
             last_error TEXT,
             created_at INTEGER NOT NULL,
             moved_at INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_dlq_moved_at ON dlq(moved_at);

         CREATE TABLE IF NOT EXISTS workers (
             worker_id TEXT PRIMARY KEY,
             pid INTEGER NOT NULL,
             hostname TEXT NOT NULL,
             started_at INTEGER NOT NULL,
             last_heartbeat_at INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_workers_heartbeat ON workers(last_heartbeat_at);

         CREATE TABLE IF NOT EXISTS config (
             key TEXT PRIMARY KEY,
             value TEXT NOT NULL
         );",
    )
    .map_err(|e| map_store_err("apply baseline schema", e))?;
    Ok(())
}

fn map_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let state_raw: String = row.get(2)?;
    let state = JobState::parse(&state_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
        )
    })?;
    Ok(Job {
        id: row.get(0)?,
        command: row.get(1)?,
        state,
        priority: row.get(3)?,
        max_retries: row.get::<_, i64>(4)? as u32,
        attempts: row.get::<_, i64>(5)? as u32,
        timeout_seconds: row.get::<_, Option<i64>>(6)?.map(|v| v as u32),
        run_at: row.get::<_, Option<i64>>(7)?.map(ms_to_dt),
        next_run_at: ms_to_dt(row.get::<_, i64>(8)?),
        worker_id: row.get(9)?,
        created_at: ms_to_dt(row.get::<_, i64>(10)?),
        updated_at: ms_to_dt(row.get::<_, i64>(11)?),
        last_error: row.get(12)?,
    })
}

fn get_job_tx(conn: &Connection, job_id: &str) -> rusqlite::Result<Option<Job>> {
    conn.query_row(
        "SELECT id, command, state, priority, max_retries, attempts, timeout_seconds,
                run_at, next_run_at, worker_id, created_at, updated_at, last_error
         FROM jobs WHERE id = ?1",
        params![job_id],
        map_job_row,
    )
    .optional()
}

fn map_dlq_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DlqEntry> {
    Ok(DlqEntry {
        dlq_id: row.get(0)?,
        original_job_id: row.get(1)?,
        command: row.get(2)?,
        attempts: row.get::<_, i64>(3)? as u32,
        last_error: row.get(4)?,
        created_at: ms_to_dt(row.get::<_, i64>(5)?),
        moved_at: ms_to_dt(row.get::<_, i64>(6)?),
    })
}

fn map_worker_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkerRecord> {
    Ok(WorkerRecord {
        worker_id: row.get(0)?,
        pid: row.get::<_, i64>(1)? as u32,
        hostname: row.get(2)?,
        started_at: ms_to_dt(row.get::<_, i64>(3)?),
        last_heartbeat_at: ms_to_dt(row.get::<_, i64>(4)?),
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
    context: &str,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| map_store_err(context, e))?);
    }
    Ok(out)
}
