//! Persisted domain records and the validated job-spec input.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QueueError, Result};

/// Persisted error messages are cut at this many characters.
pub const MAX_ERROR_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(QueueError::Validation(format!(
                "unknown job state '{}'. expected one of: pending, processing, completed, failed, dead",
                other
            ))),
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durably recorded unit of work: one shell command plus scheduling metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub priority: i64,
    pub max_retries: u32,
    pub attempts: u32,
    pub timeout_seconds: Option<u32>,
    pub run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl Job {
    /// Build a pending job from a validated spec, filling defaults.
    pub fn from_spec(spec: JobSpec, default_max_retries: u32, now: DateTime<Utc>) -> Result<Self> {
        let run_at = spec.run_at.as_deref().map(parse_timestamp).transpose()?;
        Ok(Job {
            id: spec
                .id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            command: spec.command,
            state: JobState::Pending,
            priority: spec.priority.unwrap_or(0),
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            attempts: 0,
            timeout_seconds: spec.timeout_seconds,
            run_at,
            next_run_at: run_at.unwrap_or(now),
            worker_id: None,
            created_at: now,
            updated_at: now,
            last_error: None,
        })
    }
}

/// Untyped job specification as accepted on the CLI (JSON object).
///
/// Unknown fields are rejected so a typo like `"priorty"` surfaces as a
/// validation error instead of silently enqueueing a default-priority job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_at: Option<String>,
}

impl JobSpec {
    pub fn from_json(raw: &str) -> Result<Self> {
        let spec: JobSpec = serde_json::from_str(raw)
            .map_err(|e| QueueError::Validation(format!("invalid job spec: {}", e)))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(QueueError::Validation(
                "job spec requires a non-empty 'command'".to_string(),
            ));
        }
        if let Some(id) = &self.id {
            if id.trim().is_empty() {
                return Err(QueueError::Validation(
                    "job id must be non-empty when provided".to_string(),
                ));
            }
        }
        if let Some(timeout) = self.timeout_seconds {
            if timeout == 0 {
                return Err(QueueError::Validation(
                    "timeout_seconds must be positive".to_string(),
                ));
            }
        }
        if let Some(run_at) = &self.run_at {
            parse_timestamp(run_at)?;
        }
        Ok(())
    }
}

/// Frozen record of a job that exhausted its retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub dlq_id: String,
    pub original_job_id: String,
    pub command: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub moved_at: DateTime<Utc>,
}

/// Liveness registration for one running worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub pid: u32,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// Parse an ISO-8601 timestamp. Accepts RFC 3339 and the naive
/// `YYYY-MM-DDTHH:MM:SS[.f]` form, which is treated as UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(QueueError::Validation(format!(
        "invalid timestamp '{}'. expected ISO-8601, e.g. 2024-01-01T00:00:00Z",
        value
    )))
}

/// Truncate a failure message for persistence.
pub fn truncate_error(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_LEN {
        message.to_string()
    } else {
        message.chars().take(MAX_ERROR_LEN).collect()
    }
}
