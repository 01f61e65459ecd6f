//! Spawns and supervises the pool of worker processes.
//!
//! `start` re-invokes the current executable with the hidden `worker run`
//! subcommand once per worker, records the child PIDs, and (in the
//! foreground) forwards termination: SIGTERM to every child, a grace
//! window, then SIGKILL for survivors. `stop` discovers workers from the
//! shared registry and signals those PIDs directly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::config::{ENV_DB_PATH, WORKER_PID_FILE};
use crate::error::{QueueError, Result};
use crate::queue::QueueService;

/// How long terminated children get to finish their current job before
/// SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Grace used by `worker stop` before force-killing registry PIDs.
const STOP_GRACE: Duration = Duration::from_secs(2);

pub struct WorkerSupervisor {
    db_path: PathBuf,
    pid_file: PathBuf,
}

impl WorkerSupervisor {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            pid_file: PathBuf::from(WORKER_PID_FILE),
        }
    }

    /// Spawn `count` worker processes. In the foreground, block until they
    /// exit or a shutdown signal arrives; with `detach`, leave them running.
    pub async fn start(
        &self,
        service: &QueueService,
        count: u32,
        poll_interval_ms: Option<u64>,
        detach: bool,
        shutdown: CancellationToken,
    ) -> Result<()> {
        if count == 0 {
            return Err(QueueError::Validation(
                "worker count must be at least 1".to_string(),
            ));
        }

        // Nothing may stay stuck in processing after a crash: reclaim jobs
        // held by stale workers before the new pool starts claiming.
        let recovered = service.recover_orphans()?;
        if recovered > 0 {
            tracing::info!(recovered, "Recovered jobs from stale workers");
        }

        let exe = std::env::current_exe()?;
        let mut children = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut cmd = Command::new(&exe);
            cmd.arg("worker")
                .arg("run")
                .env(ENV_DB_PATH, &self.db_path);
            if let Some(interval) = poll_interval_ms {
                cmd.arg("--poll-interval-ms").arg(interval.to_string());
            }
            let child = cmd.spawn()?;
            tracing::info!(pid = child.id(), "Started worker process");
            children.push(child);
        }

        let pids: Vec<u32> = children.iter().filter_map(|c| c.id()).collect();
        self.save_pids(&pids)?;

        if detach {
            tracing::info!(count, ?pids, "Workers running in background");
            return Ok(());
        }

        let interrupted = tokio::select! {
            _ = shutdown.cancelled() => true,
            _ = wait_all(&mut children) => false,
        };
        if interrupted {
            tracing::info!("Stopping worker processes");
            terminate_children(&mut children).await;
        }

        self.remove_pid_file();
        tracing::info!("All workers stopped");
        Ok(())
    }

    /// Signal every registered worker (plus any pidfile leftovers) to shut
    /// down, force-killing whatever survives the grace window.
    pub async fn stop(&self, service: &QueueService) -> Result<()> {
        let mut pids: Vec<u32> = service
            .store()
            .list_workers()?
            .iter()
            .map(|w| w.pid)
            .collect();
        for pid in self.load_pids() {
            if !pids.contains(&pid) {
                pids.push(pid);
            }
        }
        if pids.is_empty() {
            tracing::info!("No worker processes found");
            self.remove_pid_file();
            return Ok(());
        }

        tracing::info!(count = pids.len(), "Stopping worker processes");
        for &pid in &pids {
            if send_signal(pid, libc::SIGTERM) {
                tracing::info!(pid, "Sent SIGTERM to worker process");
            } else {
                tracing::warn!(pid, "Worker process not found");
            }
        }

        tokio::time::sleep(STOP_GRACE).await;

        for &pid in &pids {
            if process_alive(pid) {
                tracing::warn!(pid, "Worker process still running, sending SIGKILL");
                send_signal(pid, libc::SIGKILL);
            }
        }

        self.remove_pid_file();
        tracing::info!("All workers stopped");
        Ok(())
    }

    fn save_pids(&self, pids: &[u32]) -> Result<()> {
        if let Some(parent) = self.pid_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let body: String = pids.iter().map(|pid| format!("{}\n", pid)).collect();
        std::fs::write(&self.pid_file, body)?;
        Ok(())
    }

    fn load_pids(&self) -> Vec<u32> {
        let Ok(body) = std::fs::read_to_string(&self.pid_file) else {
            return Vec::new();
        };
        body.lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect()
    }

    fn remove_pid_file(&self) {
        if self.pid_file.exists() {
            let _ = std::fs::remove_file(&self.pid_file);
        }
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }
}

async fn wait_all(children: &mut [Child]) {
    for child in children.iter_mut() {
        let _ = child.wait().await;
    }
}

/// SIGTERM every child, then SIGKILL whatever is still alive once the grace
/// window closes.
async fn terminate_children(children: &mut [Child]) {
    for child in children.iter_mut() {
        if let Some(pid) = child.id() {
            send_signal(pid, libc::SIGTERM);
        }
    }

    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    for child in children.iter_mut() {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(pid = child.id(), "Worker did not exit in time, sending SIGKILL");
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
    }
}

fn send_signal(pid: u32, signal: libc::c_int) -> bool {
    // Safety: kill(2) with a concrete pid and signal constant; an ESRCH for
    // an already-gone process is the expected failure mode.
    unsafe { libc::kill(pid as libc::pid_t, signal) == 0 }
}

fn process_alive(pid: u32) -> bool {
    // Safety: signal 0 performs only the existence/permission check.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}
