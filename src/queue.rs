//! Stateless facade over the store: validation, enqueue, the centralized
//! failure handler, status aggregation, DLQ lifecycle, and orphan recovery.

use chrono::{DateTime, Duration, Utc};

use crate::config::QueueConfig;
use crate::error::Result;
use crate::models::{DlqEntry, Job, JobSpec, JobState, WorkerRecord};
use crate::store::{QueueCounts, SqliteStore};

/// Backoff delays are capped at ten years so pathological `backoff_base` /
/// attempt combinations cannot overflow timestamp arithmetic.
const MAX_BACKOFF_SECONDS: i64 = 315_360_000;

/// What the failure handler decided for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Attempt consumed, job back to pending with a backoff delay.
    Retried {
        attempts: u32,
        next_run_at: DateTime<Utc>,
    },
    /// Retry budget exhausted; job moved to the DLQ.
    DeadLettered { dlq_id: String, attempts: u32 },
    /// The job was no longer processing (resolved by another path, e.g.
    /// orphan recovery raced a slow worker). Nothing was changed.
    AlreadyReleased,
}

/// Aggregate view backing the `status` command.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub counts: QueueCounts,
    pub live_workers: Vec<WorkerRecord>,
    pub recent_failures: Vec<Job>,
}

/// Delay in seconds before a job whose `consumed`-th attempt failed becomes
/// eligible again: `backoff_base ^ consumed`, capped.
pub fn backoff_delay_seconds(backoff_base: u32, consumed: u32) -> i64 {
    i64::from(backoff_base)
        .checked_pow(consumed)
        .unwrap_or(MAX_BACKOFF_SECONDS)
        .min(MAX_BACKOFF_SECONDS)
}

#[derive(Clone)]
pub struct QueueService {
    store: SqliteStore,
}

impl QueueService {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn config(&self) -> Result<QueueConfig> {
        self.store.load_config()
    }

    // ── Enqueue ─────────────────────────────────────────────────────────

    pub fn enqueue_json(&self, raw: &str) -> Result<String> {
        self.enqueue_spec(JobSpec::from_json(raw)?)
    }

    pub fn enqueue_spec(&self, spec: JobSpec) -> Result<String> {
        spec.validate()?;
        let config = self.config()?;
        let job = Job::from_spec(spec, config.max_retries, Utc::now())?;
        let job_id = self.store.enqueue(&job)?;
        tracing::info!(job_id = %job_id, command = %job.command, priority = job.priority, "Job enqueued");
        Ok(job_id)
    }

    // ── Attempt resolution ──────────────────────────────────────────────

    pub fn handle_success(&self, job: &Job) -> Result<()> {
        if !self.store.complete(&job.id, Utc::now())? {
            tracing::warn!(job_id = %job.id, "Completed job was no longer processing");
        }
        Ok(())
    }

    /// The only place a retry-vs-DLQ decision is made. The attempt that just
    /// failed (or was interrupted) counts as consumed; `max_retries` bounds
    /// the retries after the first attempt, so a job dead-letters once
    /// `attempts + 1 > max_retries`.
    pub fn handle_failure(&self, job: &Job, error: &str) -> Result<FailureDisposition> {
        let config = self.config()?;
        let now = Utc::now();
        let consumed = job.attempts + 1;

        if consumed > job.max_retries {
            let Some(dlq_id) = self.store.fail_and_deadletter(job, error, consumed, now)? else {
                return Ok(FailureDisposition::AlreadyReleased);
            };
            tracing::warn!(
                job_id = %job.id,
                dlq_id = %dlq_id,
                attempts = consumed,
                error = %error,
                "Job exhausted retries, moved to DLQ"
            );
            return Ok(FailureDisposition::DeadLettered {
                dlq_id,
                attempts: consumed,
            });
        }

        let delay = backoff_delay_seconds(config.backoff_base, consumed);
        let next_run_at = now + Duration::seconds(delay);
        if !self
            .store
            .fail_and_retry(&job.id, error, consumed, next_run_at, now)?
        {
            return Ok(FailureDisposition::AlreadyReleased);
        }
        tracing::info!(
            job_id = %job.id,
            attempts = consumed,
            delay_seconds = delay,
            error = %error,
            "Job failed, retry scheduled"
        );
        Ok(FailureDisposition::Retried {
            attempts: consumed,
            next_run_at,
        })
    }

    // ── Listing / status ────────────────────────────────────────────────

    pub fn list_jobs(
        &self,
        state: Option<&str>,
        since: Option<DateTime<Utc>>,
        sort: &str,
        limit: u32,
    ) -> Result<Vec<Job>> {
        let state = state.map(JobState::parse).transpose()?;
        self.store.list_jobs(state, since, sort, limit)
    }

    pub fn status(&self) -> Result<StatusReport> {
        let config = self.config()?;
        let now = Utc::now();
        Ok(StatusReport {
            counts: self.store.job_counts()?,
            live_workers: self
                .store
                .live_workers(now, config.stale_worker_timeout_seconds)?,
            recent_failures: self.store.recent_failures(3)?,
        })
    }

    // ── Dead letter queue ───────────────────────────────────────────────

    pub fn list_dlq(&self, limit: u32) -> Result<Vec<DlqEntry>> {
        self.store.list_dlq(limit)
    }

    pub fn retry_dlq(&self, dlq_id: &str, same_id: bool) -> Result<String> {
        let config = self.config()?;
        let new_job_id = self
            .store
            .retry_dlq(dlq_id, same_id, config.max_retries, Utc::now())?;
        tracing::info!(dlq_id = %dlq_id, job_id = %new_job_id, "DLQ entry requeued as fresh job");
        Ok(new_job_id)
    }

    pub fn purge_dlq(&self, older_than_days: Option<u32>) -> Result<u64> {
        let purged = self.store.purge_dlq(older_than_days, Utc::now())?;
        tracing::info!(purged, older_than_days, "DLQ purged");
        Ok(purged)
    }

    // ── Orphan recovery ─────────────────────────────────────────────────

    /// Return jobs held by stale or unregistered workers to the queue,
    /// counting the interrupted attempt as consumed. A job whose interrupted
    /// attempt was its last goes to the DLQ instead of pending.
    ///
    /// Staleness is a strict timestamp comparison; the conditional release
    /// updates make a race with a slow-but-alive worker a no-op.
    pub fn recover_orphans(&self) -> Result<u64> {
        let config = self.config()?;
        let now = Utc::now();
        let orphans = self
            .store
            .find_orphaned_jobs(now, config.stale_worker_timeout_seconds)?;
        let mut recovered = 0;
        for job in orphans {
            let worker = job.worker_id.clone().unwrap_or_else(|| "unknown".to_string());
            let error = format!("recovered from stale worker {}", worker);
            match self.handle_failure(&job, &error)? {
                FailureDisposition::AlreadyReleased => {}
                disposition => {
                    tracing::warn!(
                        job_id = %job.id,
                        stale_worker = %worker,
                        ?disposition,
                        "Orphaned job recovered"
                    );
                    recovered += 1;
                }
            }
        }
        Ok(recovered)
    }
}
