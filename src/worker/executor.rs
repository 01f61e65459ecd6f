//! Child-process execution of a claimed job's command line.
//!
//! Commands run under `sh -c` in a real child process so a timeout has a
//! killable subject. Stdout is discarded; stderr is captured for the failure
//! message. On timeout the child gets SIGTERM, a short grace, then SIGKILL.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use crate::models::{truncate_error, MAX_ERROR_LEN};

/// Grace between SIGTERM and SIGKILL for a timed-out child.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Result of running one job attempt.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Success,
    Failed { exit_code: i32, stderr: String },
    TimedOut { timeout_seconds: u32 },
    SpawnError { message: String },
}

impl ExecutionOutcome {
    /// Failure message handed to the queue's failure handler; `None` for a
    /// successful run.
    pub fn failure_message(&self) -> Option<String> {
        match self {
            ExecutionOutcome::Success => None,
            ExecutionOutcome::Failed { exit_code, stderr } => {
                let mut message = format!("Command failed with exit code {}", exit_code);
                let stderr = stderr.trim();
                if !stderr.is_empty() {
                    message.push_str(": ");
                    message.push_str(&truncate_error(stderr));
                }
                Some(message)
            }
            ExecutionOutcome::TimedOut { timeout_seconds } => Some(format!(
                "Command timed out after {} seconds",
                timeout_seconds
            )),
            ExecutionOutcome::SpawnError { message } => Some(message.clone()),
        }
    }
}

/// Executes job commands via the host shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandExecutor;

impl CommandExecutor {
    pub async fn execute(
        &self,
        job_id: &str,
        command: &str,
        timeout_seconds: Option<u32>,
    ) -> ExecutionOutcome {
        tracing::info!(job_id = %job_id, command, "Executing job");

        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to spawn job command");
                return ExecutionOutcome::SpawnError {
                    message: e.to_string(),
                };
            }
        };

        // Drain stderr concurrently so a chatty child cannot block on a full
        // pipe while we wait on it.
        let stderr_task = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::with_capacity(MAX_ERROR_LEN);
                let _ = pipe.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).to_string()
            })
        });

        let waited = match timeout_seconds {
            Some(secs) => {
                match tokio::time::timeout(Duration::from_secs(u64::from(secs)), child.wait())
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(job_id = %job_id, timeout_seconds = secs, "Job timed out, terminating child");
                        terminate(&mut child).await;
                        return ExecutionOutcome::TimedOut {
                            timeout_seconds: secs,
                        };
                    }
                }
            }
            None => child.wait().await,
        };

        let status = match waited {
            Ok(status) => status,
            Err(e) => {
                return ExecutionOutcome::SpawnError {
                    message: format!("failed waiting for command: {}", e),
                }
            }
        };

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            tracing::info!(job_id = %job_id, "Job command succeeded");
            ExecutionOutcome::Success
        } else {
            let exit_code = status.code().unwrap_or(-1);
            tracing::warn!(job_id = %job_id, exit_code, "Job command failed");
            ExecutionOutcome::Failed { exit_code, stderr }
        }
    }
}

/// SIGTERM, short grace, then SIGKILL.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // Safety: kill(2) with a valid pid and signal number has no memory
        // safety concerns; failure (e.g. the child already exited) is benign.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}
