//! Queue-service behavior: the centralized failure handler's retry
//! accounting, enqueue defaulting, and orphan recovery.

mod common;

use chrono::{Duration, Utc};
use queuectl::error::QueueError;
use queuectl::models::{JobState, WorkerRecord};
use queuectl::queue::{FailureDisposition, QueueService};

use common::TempDb;

#[test]
fn enqueue_applies_the_configured_default_max_retries() {
    let db = TempDb::new();
    let service = QueueService::new(db.open());
    service
        .store()
        .set_config("max_retries", "5")
        .expect("set config");

    service
        .enqueue_json(r#"{"id": "a", "command": "true"}"#)
        .expect("enqueue");
    let job = service
        .store()
        .get_job("a")
        .expect("get")
        .expect("job exists");
    assert_eq!(job.max_retries, 5);
}

#[test]
fn enqueue_rejects_malformed_specs() {
    let db = TempDb::new();
    let service = QueueService::new(db.open());

    let err = service
        .enqueue_json(r#"{"command": ""}"#)
        .expect_err("empty command");
    assert!(matches!(err, QueueError::Validation(_)));
    let err = service
        .enqueue_json(r#"{"command": "true", "run_at": "yesterday"}"#)
        .expect_err("bad run_at");
    assert!(matches!(err, QueueError::Validation(_)));
    assert!(service.enqueue_json("not json").is_err());
}

#[test]
fn failure_handler_schedules_exponential_backoff() {
    let db = TempDb::new();
    let service = QueueService::new(db.open());
    service
        .enqueue_json(r#"{"id": "b", "command": "false", "max_retries": 2}"#)
        .expect("enqueue");
    let store = service.store();
    let t0 = Utc::now();

    // First failure: attempt 1 consumed, delay 2^1 = 2s.
    let job = store.claim_next("w", t0).expect("claim").expect("job");
    let before = Utc::now();
    let FailureDisposition::Retried {
        attempts,
        next_run_at,
    } = service
        .handle_failure(&job, "Command failed with exit code 1")
        .expect("handle failure")
    else {
        panic!("expected retry");
    };
    assert_eq!(attempts, 1);
    let delay_ms = (next_run_at - before).num_milliseconds();
    assert!((2000..=3000).contains(&delay_ms), "delay was {}ms", delay_ms);

    // Not eligible before the backoff elapses.
    assert!(store.claim_next("w", before).expect("claim").is_none());

    // Second failure: attempt 2 consumed, delay 2^2 = 4s.
    let job = store
        .claim_next("w", t0 + Duration::seconds(30))
        .expect("claim")
        .expect("eligible after backoff");
    assert_eq!(job.attempts, 1);
    let before = Utc::now();
    let FailureDisposition::Retried {
        attempts,
        next_run_at,
    } = service
        .handle_failure(&job, "Command failed with exit code 1")
        .expect("handle failure")
    else {
        panic!("expected retry");
    };
    assert_eq!(attempts, 2);
    let delay_ms = (next_run_at - before).num_milliseconds();
    assert!((4000..=5000).contains(&delay_ms), "delay was {}ms", delay_ms);

    // Third failure exhausts max_retries=2: dead letter with attempts=3.
    let job = store
        .claim_next("w", t0 + Duration::seconds(120))
        .expect("claim")
        .expect("eligible after backoff");
    let FailureDisposition::DeadLettered { attempts, dlq_id } = service
        .handle_failure(&job, "Command failed with exit code 1")
        .expect("handle failure")
    else {
        panic!("expected dead letter");
    };
    assert_eq!(attempts, 3);

    let dead = store.get_job("b").expect("get").expect("job");
    assert_eq!(dead.state, JobState::Dead);
    let entries = store.list_dlq(10).expect("list dlq");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].dlq_id, dlq_id);
    assert_eq!(entries[0].attempts, 3);
    assert!(entries[0]
        .last_error
        .as_deref()
        .expect("error recorded")
        .contains("exit code 1"));
}

#[test]
fn zero_max_retries_dead_letters_on_first_failure() {
    let db = TempDb::new();
    let service = QueueService::new(db.open());
    service
        .enqueue_json(r#"{"id": "once", "command": "false", "max_retries": 0}"#)
        .expect("enqueue");

    let job = service
        .store()
        .claim_next("w", Utc::now())
        .expect("claim")
        .expect("job");
    let disposition = service
        .handle_failure(&job, "Command failed with exit code 1")
        .expect("handle failure");
    assert!(matches!(
        disposition,
        FailureDisposition::DeadLettered { attempts: 1, .. }
    ));
    assert_eq!(service.store().list_dlq(10).expect("dlq").len(), 1);
}

#[test]
fn failure_handler_is_a_noop_for_released_jobs() {
    let db = TempDb::new();
    let service = QueueService::new(db.open());
    service
        .enqueue_json(r#"{"id": "a", "command": "false"}"#)
        .expect("enqueue");
    let job = service
        .store()
        .claim_next("w", Utc::now())
        .expect("claim")
        .expect("job");
    service.store().complete("a", Utc::now()).expect("complete");

    // The attempt resolved through another path before the handler ran.
    let disposition = service
        .handle_failure(&job, "late failure")
        .expect("handle failure");
    assert_eq!(disposition, FailureDisposition::AlreadyReleased);
    let job = service.store().get_job("a").expect("get").expect("job");
    assert_eq!(job.state, JobState::Completed);
}

fn register(service: &QueueService, worker_id: &str, heartbeat_age_seconds: i64) {
    let now = Utc::now();
    service
        .store()
        .register_worker(&WorkerRecord {
            worker_id: worker_id.to_string(),
            pid: 4242,
            hostname: "host".to_string(),
            started_at: now - Duration::seconds(heartbeat_age_seconds),
            last_heartbeat_at: now - Duration::seconds(heartbeat_age_seconds),
        })
        .expect("register worker");
}

#[test]
fn orphan_recovery_returns_stale_claims_to_pending() {
    let db = TempDb::new();
    let service = QueueService::new(db.open());
    register(&service, "w-stale", 120);
    service
        .enqueue_json(r#"{"id": "c", "command": "sleep 30"}"#)
        .expect("enqueue");
    service
        .store()
        .claim_next("w-stale", Utc::now())
        .expect("claim")
        .expect("job");

    let recovered = service.recover_orphans().expect("recover");
    assert_eq!(recovered, 1);

    let job = service.store().get_job("c").expect("get").expect("job");
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 1, "interrupted attempt counts as consumed");
    assert!(job.worker_id.is_none());
    assert!(job
        .last_error
        .as_deref()
        .expect("recovery recorded")
        .contains("stale worker w-stale"));
}

#[test]
fn orphan_recovery_spares_heartbeating_workers() {
    let db = TempDb::new();
    let service = QueueService::new(db.open());
    register(&service, "w-live", 0);
    service
        .enqueue_json(r#"{"id": "c", "command": "sleep 30"}"#)
        .expect("enqueue");
    service
        .store()
        .claim_next("w-live", Utc::now())
        .expect("claim")
        .expect("job");

    assert_eq!(service.recover_orphans().expect("recover"), 0);
    let job = service.store().get_job("c").expect("get").expect("job");
    assert_eq!(job.state, JobState::Processing);
    assert_eq!(job.worker_id.as_deref(), Some("w-live"));
}

#[test]
fn orphan_recovery_dead_letters_jobs_out_of_budget() {
    let db = TempDb::new();
    let service = QueueService::new(db.open());
    register(&service, "w-stale", 120);
    service
        .enqueue_json(r#"{"id": "c", "command": "false", "max_retries": 0}"#)
        .expect("enqueue");
    service
        .store()
        .claim_next("w-stale", Utc::now())
        .expect("claim")
        .expect("job");

    assert_eq!(service.recover_orphans().expect("recover"), 1);
    let job = service.store().get_job("c").expect("get").expect("job");
    assert_eq!(job.state, JobState::Dead);
    assert_eq!(job.attempts, 1);
    assert_eq!(service.store().list_dlq(10).expect("dlq").len(), 1);
}

#[test]
fn list_jobs_filters_and_validates_state() {
    let db = TempDb::new();
    let service = QueueService::new(db.open());
    service
        .enqueue_json(r#"{"id": "a", "command": "true"}"#)
        .expect("enqueue");
    service
        .enqueue_json(r#"{"id": "b", "command": "true"}"#)
        .expect("enqueue");
    service
        .store()
        .claim_next("w", Utc::now())
        .expect("claim")
        .expect("job");

    let pending = service
        .list_jobs(Some("pending"), None, "created_at", 10)
        .expect("list");
    assert_eq!(pending.len(), 1);
    let all = service.list_jobs(None, None, "created_at", 10).expect("list");
    assert_eq!(all.len(), 2);

    let err = service
        .list_jobs(Some("bogus"), None, "created_at", 10)
        .expect_err("invalid state");
    assert!(matches!(err, QueueError::Validation(_)));
    let err = service
        .list_jobs(None, None, "bogus", 10)
        .expect_err("invalid sort");
    assert!(matches!(err, QueueError::Validation(_)));
}

#[test]
fn dlq_retry_round_trip_through_the_service() {
    let db = TempDb::new();
    let service = QueueService::new(db.open());
    service
        .enqueue_json(r#"{"id": "a", "command": "false", "max_retries": 0}"#)
        .expect("enqueue");
    let job = service
        .store()
        .claim_next("w", Utc::now())
        .expect("claim")
        .expect("job");
    service
        .handle_failure(&job, "Command failed with exit code 1")
        .expect("dead letter");

    let entry = &service.list_dlq(10).expect("dlq")[0];
    let new_id = service.retry_dlq(&entry.dlq_id, false).expect("retry");
    let fresh = service
        .store()
        .get_job(&new_id)
        .expect("get")
        .expect("fresh job");
    assert_eq!(fresh.attempts, 0);
    assert_eq!(fresh.state, JobState::Pending);
    assert!(service.list_dlq(10).expect("dlq").is_empty());

    let err = service
        .retry_dlq("no-such-entry", false)
        .expect_err("unknown entry");
    assert!(matches!(err, QueueError::NotFound(_)));
}

#[test]
fn status_reports_counts_and_live_workers() {
    let db = TempDb::new();
    let service = QueueService::new(db.open());
    register(&service, "w-live", 0);
    register(&service, "w-stale", 120);
    service
        .enqueue_json(r#"{"id": "a", "command": "true"}"#)
        .expect("enqueue");

    let report = service.status().expect("status");
    assert_eq!(report.counts.pending, 1);
    assert_eq!(report.live_workers.len(), 1);
    assert_eq!(report.live_workers[0].worker_id, "w-live");
    assert!(report.recent_failures.is_empty());
}
