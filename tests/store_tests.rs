//! Store-level behavior: atomic claims, lifecycle transitions, the DLQ
//! round trip, the worker registry, and configuration persistence.

mod common;

use std::collections::HashSet;

use chrono::{Duration, Utc};
use queuectl::error::QueueError;
use queuectl::models::{JobState, WorkerRecord};

use common::{job, job_with, TempDb};

#[test]
fn enqueue_and_get_round_trip() {
    let db = TempDb::new();
    let store = db.open();
    let job = job_with("a", "echo hello", |spec| {
        spec.priority = Some(4);
        spec.timeout_seconds = Some(30);
    });
    store.enqueue(&job).expect("enqueue");

    let loaded = store.get_job("a").expect("get").expect("job exists");
    assert_eq!(loaded.command, "echo hello");
    assert_eq!(loaded.state, JobState::Pending);
    assert_eq!(loaded.priority, 4);
    assert_eq!(loaded.timeout_seconds, Some(30));
    assert_eq!(loaded.attempts, 0);
    assert!(loaded.worker_id.is_none());
}

#[test]
fn enqueue_rejects_duplicate_id() {
    let db = TempDb::new();
    let store = db.open();
    store.enqueue(&job("a", "true")).expect("first enqueue");
    let err = store
        .enqueue(&job("a", "true"))
        .expect_err("duplicate must fail");
    assert!(matches!(err, QueueError::DuplicateId(ref id) if id == "a"));
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn claim_transitions_pending_to_processing() {
    let db = TempDb::new();
    let store = db.open();
    store.enqueue(&job("a", "true")).expect("enqueue");

    let claimed = store
        .claim_next("w1", Utc::now())
        .expect("claim")
        .expect("job claimed");
    assert_eq!(claimed.id, "a");
    assert_eq!(claimed.state, JobState::Processing);
    assert_eq!(claimed.worker_id.as_deref(), Some("w1"));

    // Nothing else is eligible while the claim is held.
    assert!(store.claim_next("w2", Utc::now()).expect("claim").is_none());
}

#[test]
fn claim_skips_jobs_scheduled_in_the_future() {
    let db = TempDb::new();
    let store = db.open();
    let now = Utc::now();
    let mut future = job("later", "true");
    future.next_run_at = now + Duration::seconds(60);
    store.enqueue(&future).expect("enqueue");

    assert!(store.claim_next("w1", now).expect("claim").is_none());
    let claimed = store
        .claim_next("w1", now + Duration::seconds(61))
        .expect("claim");
    assert_eq!(claimed.expect("eligible now").id, "later");
}

#[test]
fn claim_orders_by_priority_then_age_then_id() {
    let db = TempDb::new();
    let store = db.open();
    let now = Utc::now();

    let mut low = job_with("low", "true", |s| s.priority = Some(1));
    let mut high = job_with("high", "true", |s| s.priority = Some(100));
    let mut mid = job_with("mid", "true", |s| s.priority = Some(50));
    // Same creation instant so ordering is purely by priority.
    for j in [&mut low, &mut high, &mut mid] {
        j.created_at = now;
        j.next_run_at = now;
    }
    store.enqueue(&low).expect("enqueue");
    store.enqueue(&high).expect("enqueue");
    store.enqueue(&mid).expect("enqueue");

    let order: Vec<String> = (0..3)
        .map(|_| store.claim_next("w", now).expect("claim").expect("job").id)
        .collect();
    assert_eq!(order, ["high", "mid", "low"]);
}

#[test]
fn claim_breaks_priority_and_age_ties_by_id() {
    let db = TempDb::new();
    let store = db.open();
    let now = Utc::now();
    let mut b = job("b", "true");
    let mut a = job("a", "true");
    for j in [&mut a, &mut b] {
        j.created_at = now;
        j.next_run_at = now;
    }
    store.enqueue(&b).expect("enqueue");
    store.enqueue(&a).expect("enqueue");

    let first = store.claim_next("w", now).expect("claim").expect("job");
    assert_eq!(first.id, "a");
}

#[test]
fn concurrent_claims_hand_each_job_to_exactly_one_worker() {
    let db = TempDb::new();
    let store = db.open();
    for i in 0..20 {
        store
            .enqueue(&job(&format!("job-{:02}", i), "true"))
            .expect("enqueue");
    }
    let claim_at = Utc::now() + Duration::seconds(1);

    // Independent store handles (own connections) racing on one file.
    let mut handles = Vec::new();
    for t in 0..8 {
        let worker_store = db.open();
        handles.push(std::thread::spawn(move || {
            let worker_id = format!("w{}", t);
            let mut claimed = Vec::new();
            while let Some(job) = worker_store
                .claim_next(&worker_id, claim_at)
                .expect("claim must not error under contention")
            {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut all: Vec<String> = Vec::new();
    for handle in handles {
        all.extend(handle.join().expect("claimant thread"));
    }
    assert_eq!(all.len(), 20, "every job claimed exactly once");
    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(unique.len(), 20, "no job claimed twice");
}

#[test]
fn complete_requires_a_processing_claim() {
    let db = TempDb::new();
    let store = db.open();
    store.enqueue(&job("a", "true")).expect("enqueue");
    assert!(!store.complete("a", Utc::now()).expect("complete"));

    store.claim_next("w1", Utc::now()).expect("claim");
    assert!(store.complete("a", Utc::now()).expect("complete"));
    let done = store.get_job("a").expect("get").expect("job");
    assert_eq!(done.state, JobState::Completed);
    assert!(done.worker_id.is_none());
}

#[test]
fn fail_and_retry_releases_the_claim_with_backoff() {
    let db = TempDb::new();
    let store = db.open();
    store.enqueue(&job("a", "false")).expect("enqueue");
    store.claim_next("w1", Utc::now()).expect("claim");

    let now = Utc::now();
    let next = now + Duration::seconds(2);
    assert!(store
        .fail_and_retry("a", "Command failed with exit code 1", 1, next, now)
        .expect("retry"));

    let job = store.get_job("a").expect("get").expect("job");
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 1);
    assert!(job.worker_id.is_none());
    assert_eq!(job.next_run_at, next);
    assert!(job
        .last_error
        .as_deref()
        .expect("error recorded")
        .contains("exit code 1"));

    // Not eligible again until the backoff elapses.
    assert!(store.claim_next("w1", now).expect("claim").is_none());
    assert!(store
        .claim_next("w1", next + Duration::seconds(1))
        .expect("claim")
        .is_some());
}

#[test]
fn fail_and_retry_ignores_jobs_no_longer_processing() {
    let db = TempDb::new();
    let store = db.open();
    store.enqueue(&job("a", "false")).expect("enqueue");
    let now = Utc::now();
    assert!(!store
        .fail_and_retry("a", "late resolution", 1, now, now)
        .expect("no-op"));
    let job = store.get_job("a").expect("get").expect("job");
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
}

#[test]
fn dead_letter_is_atomic_with_the_job_transition() {
    let db = TempDb::new();
    let store = db.open();
    store.enqueue(&job("a", "false")).expect("enqueue");
    let claimed = store
        .claim_next("w1", Utc::now())
        .expect("claim")
        .expect("job");

    let now = Utc::now();
    let dlq_id = store
        .fail_and_deadletter(&claimed, "Command failed with exit code 1", 4, now)
        .expect("deadletter")
        .expect("was processing");

    let job = store.get_job("a").expect("get").expect("job");
    assert_eq!(job.state, JobState::Dead);
    assert!(job.worker_id.is_none());
    assert_eq!(job.attempts, 4);

    let entries = store.list_dlq(10).expect("list dlq");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].dlq_id, dlq_id);
    assert_eq!(entries[0].original_job_id, "a");
    assert_eq!(entries[0].attempts, 4);
    assert!(entries[0]
        .last_error
        .as_deref()
        .expect("error carried over")
        .contains("exit code 1"));
}

#[test]
fn dlq_retry_creates_one_fresh_pending_job_and_removes_the_entry() {
    let db = TempDb::new();
    let store = db.open();
    store.enqueue(&job("a", "false")).expect("enqueue");
    let claimed = store
        .claim_next("w1", Utc::now())
        .expect("claim")
        .expect("job");
    let dlq_id = store
        .fail_and_deadletter(&claimed, "boom", 1, Utc::now())
        .expect("deadletter")
        .expect("was processing");

    let new_id = store
        .retry_dlq(&dlq_id, false, 3, Utc::now())
        .expect("retry dlq");
    assert_ne!(new_id, "a");

    let fresh = store.get_job(&new_id).expect("get").expect("new job");
    assert_eq!(fresh.state, JobState::Pending);
    assert_eq!(fresh.attempts, 0);
    assert_eq!(fresh.command, "false");
    assert!(fresh.last_error.is_none());
    assert!(store.list_dlq(10).expect("list dlq").is_empty());
}

#[test]
fn dlq_retry_same_id_conflicts_with_a_live_job() {
    let db = TempDb::new();
    let store = db.open();
    store.enqueue(&job("a", "false")).expect("enqueue");
    let claimed = store
        .claim_next("w1", Utc::now())
        .expect("claim")
        .expect("job");
    let dlq_id = store
        .fail_and_deadletter(&claimed, "boom", 1, Utc::now())
        .expect("deadletter")
        .expect("was processing");

    // The dead job row still occupies the original id.
    let err = store
        .retry_dlq(&dlq_id, true, 3, Utc::now())
        .expect_err("same-id conflict");
    assert!(matches!(err, QueueError::DuplicateId(_)));
    assert_eq!(store.list_dlq(10).expect("list dlq").len(), 1);
}

#[test]
fn dlq_retry_unknown_entry_is_not_found() {
    let db = TempDb::new();
    let store = db.open();
    let err = store
        .retry_dlq("missing", false, 3, Utc::now())
        .expect_err("unknown dlq id");
    assert!(matches!(err, QueueError::NotFound(_)));
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn purge_dlq_honors_the_age_cutoff() {
    let db = TempDb::new();
    let store = db.open();
    let now = Utc::now();

    for (id, moved_at) in [("old", now - Duration::days(40)), ("new", now)] {
        store.enqueue(&job(id, "false")).expect("enqueue");
        let claimed = store
            .claim_next("w1", Utc::now() + Duration::seconds(1))
            .expect("claim")
            .expect("job");
        store
            .fail_and_deadletter(&claimed, "boom", 1, moved_at)
            .expect("deadletter")
            .expect("was processing");
    }

    let purged = store.purge_dlq(Some(30), now).expect("purge");
    assert_eq!(purged, 1);
    let remaining = store.list_dlq(10).expect("list dlq");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].original_job_id, "new");

    assert_eq!(store.purge_dlq(None, now).expect("purge all"), 1);
    assert!(store.list_dlq(10).expect("list dlq").is_empty());
}

#[test]
fn worker_registry_tracks_liveness_by_heartbeat() {
    let db = TempDb::new();
    let store = db.open();
    let now = Utc::now();

    store
        .register_worker(&WorkerRecord {
            worker_id: "w-live".to_string(),
            pid: 101,
            hostname: "host".to_string(),
            started_at: now,
            last_heartbeat_at: now,
        })
        .expect("register");
    store
        .register_worker(&WorkerRecord {
            worker_id: "w-stale".to_string(),
            pid: 102,
            hostname: "host".to_string(),
            started_at: now - Duration::seconds(120),
            last_heartbeat_at: now - Duration::seconds(120),
        })
        .expect("register");

    let live = store.live_workers(now, 30).expect("live workers");
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].worker_id, "w-live");

    assert!(store.heartbeat("w-stale", now).expect("heartbeat"));
    assert_eq!(store.live_workers(now, 30).expect("live workers").len(), 2);

    store.unregister_worker("w-live").expect("unregister");
    assert_eq!(store.list_workers().expect("list").len(), 1);
    assert!(!store.heartbeat("w-live", now).expect("heartbeat gone"));
}

#[test]
fn orphan_scan_uses_strict_staleness_and_catches_unregistered_workers() {
    let db = TempDb::new();
    let store = db.open();
    let now = Utc::now();

    store
        .register_worker(&WorkerRecord {
            worker_id: "w-live".to_string(),
            pid: 101,
            hostname: "host".to_string(),
            started_at: now,
            last_heartbeat_at: now,
        })
        .expect("register");
    store
        .register_worker(&WorkerRecord {
            worker_id: "w-stale".to_string(),
            pid: 102,
            hostname: "host".to_string(),
            started_at: now - Duration::seconds(120),
            last_heartbeat_at: now - Duration::seconds(120),
        })
        .expect("register");

    for id in ["held-live", "held-stale", "held-gone"] {
        store.enqueue(&job(id, "sleep 30")).expect("enqueue");
    }
    let claim_at = Utc::now() + Duration::seconds(1);
    store.claim_next("w-live", claim_at).expect("claim");
    store.claim_next("w-stale", claim_at).expect("claim");
    // Third claim under a worker id that never registered (killed before
    // registration persisted, or registry lost).
    store.claim_next("w-gone", claim_at).expect("claim");

    let orphans = store.find_orphaned_jobs(now, 30).expect("orphan scan");
    let ids: HashSet<String> = orphans.into_iter().map(|j| j.id).collect();
    assert!(ids.contains("held-stale"));
    assert!(ids.contains("held-gone"));
    assert!(!ids.contains("held-live"), "live worker keeps its claim");
}

#[test]
fn config_set_is_idempotent_and_readable() {
    let db = TempDb::new();
    let store = db.open();

    assert!(store.get_config("max_retries").expect("get").is_none());
    store.set_config("max_retries", "5").expect("set");
    store.set_config("max_retries", "5").expect("set again");
    assert_eq!(
        store.get_config("max_retries").expect("get").as_deref(),
        Some("5")
    );
    assert_eq!(store.load_config().expect("snapshot").max_retries, 5);

    // Reopening sees the same state.
    let reopened = db.open();
    assert_eq!(reopened.load_config().expect("snapshot").max_retries, 5);
}

#[test]
fn job_counts_cover_every_state_and_the_dlq() {
    let db = TempDb::new();
    let store = db.open();

    store.enqueue(&job("p", "true")).expect("enqueue");
    store.enqueue(&job("c", "true")).expect("enqueue");
    store.enqueue(&job("d", "false")).expect("enqueue");
    let now = Utc::now() + Duration::seconds(1);

    let claimed = store.claim_next("w", now).expect("claim").expect("job");
    store.complete(&claimed.id, now).expect("complete");
    let doomed = store.claim_next("w", now).expect("claim").expect("job");
    store
        .fail_and_deadletter(&doomed, "boom", 1, now)
        .expect("deadletter");

    let counts = store.job_counts().expect("counts");
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.dead, 1);
    assert_eq!(counts.dlq, 1);
    assert_eq!(counts.processing, 0);
}
