#![allow(dead_code)]

use std::path::PathBuf;

use chrono::Utc;
use queuectl::models::{Job, JobSpec};
use queuectl::store::SqliteStore;
use uuid::Uuid;

/// Throwaway on-disk database. On-disk (not in-memory) because the claim
/// protocol is exercised across independent connections to the same file.
pub struct TempDb {
    pub path: PathBuf,
}

impl TempDb {
    pub fn new() -> Self {
        let path = std::env::temp_dir().join(format!("queuectl-test-{}.db", Uuid::new_v4()));
        Self { path }
    }

    /// Open a fresh store handle (own connection) on this database.
    pub fn open(&self) -> SqliteStore {
        SqliteStore::open(&self.path).expect("open test store")
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut name = self.path.as_os_str().to_os_string();
            name.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(name));
        }
    }
}

/// Pending job from a bare command, defaults everywhere else.
pub fn job(id: &str, command: &str) -> Job {
    job_with(id, command, |_| {})
}

/// Pending job with spec tweaks applied before materialization.
pub fn job_with(id: &str, command: &str, tweak: impl FnOnce(&mut JobSpec)) -> Job {
    let mut spec = JobSpec {
        id: Some(id.to_string()),
        command: command.to_string(),
        ..Default::default()
    };
    tweak(&mut spec);
    Job::from_spec(spec, 3, Utc::now()).expect("job from spec")
}
