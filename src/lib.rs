//! # queuectl
//!
//! Durable single-node background job queue driven from a CLI.
//!
//! Shell commands are recorded as jobs in an embedded WAL-mode SQLite
//! database, claimed atomically by a pool of worker processes, retried with
//! exponential backoff, and quarantined in a dead letter queue once their
//! retry budget is exhausted. Worker liveness is tracked through heartbeats
//! so jobs held by crashed workers are recovered automatically.
//!
//! - [`store::SqliteStore`] — transactional persistence and the atomic claim
//! - [`queue::QueueService`] — enqueue, status, DLQ lifecycle, the
//!   centralized retry-vs-DLQ failure handler, orphan recovery
//! - [`worker::WorkerRuntime`] — claim-execute-resolve loop with heartbeats
//! - [`worker::supervisor::WorkerSupervisor`] — worker pool process control
//! - [`cli`] — the `queuectl` command surface

pub mod cli;
pub mod config;
pub mod error;
pub mod models;
pub mod queue;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use error::{QueueError, Result};
