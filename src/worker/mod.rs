//! Worker runtime: one claim-execute-resolve loop per worker process.
//!
//! The loop registers the worker in the shared registry, emits heartbeats on
//! the configured cadence, claims one job at a time, and resolves every
//! attempt through the queue's failure handler — the worker itself never
//! decides between retry and DLQ. Shutdown is cooperative: the current job
//! runs to completion (bounded by its own timeout) before the loop exits and
//! the worker unregisters.

pub mod executor;
pub mod supervisor;

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Job, WorkerRecord};
use crate::queue::QueueService;

pub use executor::{CommandExecutor, ExecutionOutcome};

pub struct WorkerRuntime {
    worker_id: String,
    service: QueueService,
    executor: CommandExecutor,
    shutdown: CancellationToken,
    poll_interval_override_ms: Option<u64>,
}

impl WorkerRuntime {
    pub fn new(service: QueueService, shutdown: CancellationToken) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            worker_id: format!("worker-{}", &suffix[..8]),
            service,
            executor: CommandExecutor,
            shutdown,
            poll_interval_override_ms: None,
        }
    }

    /// Override the configured poll interval (the `worker start
    /// --poll-interval-ms` flag, forwarded to each worker process).
    pub fn with_poll_interval_ms(mut self, interval_ms: Option<u64>) -> Self {
        self.poll_interval_override_ms = interval_ms;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn run(self) -> Result<()> {
        self.register()?;
        tracing::info!(worker_id = %self.worker_id, pid = std::process::id(), "Worker started");

        self.run_loop().await;

        if let Err(e) = self.service.store().unregister_worker(&self.worker_id) {
            tracing::warn!(worker_id = %self.worker_id, error = %e, "Failed to unregister worker");
        }
        tracing::info!(worker_id = %self.worker_id, "Worker shutdown complete");
        Ok(())
    }

    fn register(&self) -> Result<()> {
        let now = Utc::now();
        self.service.store().register_worker(&WorkerRecord {
            worker_id: self.worker_id.clone(),
            pid: std::process::id(),
            hostname: hostname(),
            started_at: now,
            last_heartbeat_at: now,
        })
    }

    async fn run_loop(&self) {
        let config = match self.service.config() {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(worker_id = %self.worker_id, error = %e, "Failed to load config, worker exiting");
                return;
            }
        };
        let poll_interval = Duration::from_millis(
            self.poll_interval_override_ms
                .unwrap_or(config.poll_interval_ms),
        );
        let heartbeat_interval =
            chrono::Duration::seconds(config.worker_heartbeat_interval_seconds as i64);
        let mut last_heartbeat = Utc::now();

        while !self.shutdown.is_cancelled() {
            let now = Utc::now();
            if now - last_heartbeat >= heartbeat_interval {
                match self.service.store().heartbeat(&self.worker_id, now) {
                    Ok(true) => {}
                    // Registry row vanished (e.g. purged); re-register so
                    // liveness tracking keeps working.
                    Ok(false) => {
                        if let Err(e) = self.register() {
                            tracing::warn!(worker_id = %self.worker_id, error = %e, "Failed to re-register worker");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(worker_id = %self.worker_id, error = %e, "Heartbeat failed");
                    }
                }
                last_heartbeat = now;
            }

            match self.service.store().claim_next(&self.worker_id, now) {
                Ok(Some(job)) => self.execute_and_resolve(job).await,
                Ok(None) => self.idle_sleep(poll_interval).await,
                Err(e) => {
                    tracing::warn!(worker_id = %self.worker_id, error = %e, "Claim failed, backing off");
                    self.idle_sleep(poll_interval).await;
                }
            }
        }
    }

    async fn execute_and_resolve(&self, job: Job) {
        let started = Utc::now();
        let outcome = self
            .executor
            .execute(&job.id, &job.command, job.timeout_seconds)
            .await;
        let elapsed_ms = (Utc::now() - started).num_milliseconds();

        let resolved = match outcome.failure_message() {
            None => {
                tracing::info!(
                    worker_id = %self.worker_id,
                    job_id = %job.id,
                    elapsed_ms,
                    "Job completed"
                );
                self.service.handle_success(&job)
            }
            Some(message) => self.service.handle_failure(&job, &message).map(|_| ()),
        };

        // A store error here leaves the job processing under our id; if it
        // keeps failing we go stale and orphan recovery returns the job.
        if let Err(e) = resolved {
            tracing::error!(
                worker_id = %self.worker_id,
                job_id = %job.id,
                error = %e,
                "Failed to resolve job attempt"
            );
        }
    }

    async fn idle_sleep(&self, interval: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    // Safety: gethostname writes a NUL-terminated name into the caller's
    // buffer and never reads it; a failure leaves the buffer untouched.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).to_string()
    } else {
        "unknown".to_string()
    }
}
