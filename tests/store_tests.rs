
use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use schedarray::scheduler::{JobSpec, JobState, Scheduler};
use schedarray::store::{CancelOutcome, JobStore};
use test_harness::TestEnv;

fn store(env: &TestEnv) -> JobStore {
    JobStore::open(&env.config.db_path).expect("open store")
}

fn insert(store: &mut JobStore, spec: JobSpec) -> String {
    store.insert(&spec, "tester").expect("insert job").job_id
}

#[test]
fn ids_are_monotonic_within_a_store() {
    let env = TestEnv::new();
    let mut store = store(&env);
    let first = insert(&mut store, JobSpec::new("echo 1"));
    let second = insert(&mut store, JobSpec::new("echo 2"));
    let third = insert(&mut store, JobSpec::new("echo 3"));
    assert!(first < second && second < third);
}

#[test]
fn state_survives_reopen() {
    let env = TestEnv::new();
    let job_id = {
        let mut store = store(&env);
        insert(&mut store, JobSpec::new("echo persist"))
    };
    let reopened = store(&env);
    let job = reopened.get(&job_id).unwrap().expect("job after reopen");
    assert_eq!(job.command, "echo persist");
    assert_eq!(job.state, JobState::Pending);
}

#[test]
fn claim_takes_highest_priority_then_earliest_submission() {
    let env = TestEnv::new();
    let mut store = store(&env);

    let low = insert(&mut store, JobSpec::new("echo a"));
    thread::sleep(Duration::from_millis(5));
    let mut high = JobSpec::new("echo b");
    high.priority = 5;
    let high_first = insert(&mut store, high);
    thread::sleep(Duration::from_millis(5));
    let mut high_late = JobSpec::new("echo c");
    high_late.priority = 5;
    let high_second = insert(&mut store, high_late);

    let order: Vec<String> = (0..3)
        .map(|_| store.claim_one("w1").unwrap().expect("claim").job_id)
        .collect();
    assert_eq!(order, vec![high_first, high_second, low]);
    assert!(store.claim_one("w1").unwrap().is_none());
}

#[test]
fn claim_flips_the_row_to_running() {
    let env = TestEnv::new();
    let mut store = store(&env);
    insert(&mut store, JobSpec::new("echo claim"));

    let claimed = store.claim_one("worker-1-abc").unwrap().expect("claim");
    assert_eq!(claimed.state, JobState::Running);
    assert_eq!(claimed.worker_id.as_deref(), Some("worker-1-abc"));
    assert!(claimed.start_time.is_some());
    assert!(claimed.submit_time <= claimed.start_time.unwrap());
    assert!(claimed.end_time.is_none());
    assert!(claimed.pid.is_none());
}

#[test]
fn claim_on_empty_queue_has_no_side_effects() {
    let env = TestEnv::new();
    let mut store = store(&env);
    assert!(store.claim_one("w1").unwrap().is_none());
    assert!(store.count_by_state().unwrap().is_empty());
}

#[test]
fn concurrent_claimers_never_share_a_job() {
    let env = TestEnv::new();
    let pending = 6usize;
    let claimers = 10usize;
    {
        let mut store = store(&env);
        for n in 0..pending {
            insert(&mut store, JobSpec::new(format!("echo {n}")));
        }
    }

    let db_path = env.config.db_path.clone();
    let handles: Vec<_> = (0..claimers)
        .map(|n| {
            let db_path = db_path.clone();
            thread::spawn(move || {
                let mut store = JobStore::open(&db_path).expect("open store");
                store
                    .claim_one(&format!("w{n}"))
                    .expect("claim")
                    .map(|job| job.job_id)
            })
        })
        .collect();

    let claimed: Vec<String> = handles
        .into_iter()
        .filter_map(|handle| handle.join().expect("join claimer"))
        .collect();

    // Exactly min(claimers, pending) wins, all distinct.
    assert_eq!(claimed.len(), pending.min(claimers));
    let unique: HashSet<&String> = claimed.iter().collect();
    assert_eq!(unique.len(), claimed.len());
}

#[test]
fn finish_only_applies_to_running_rows() {
    let env = TestEnv::new();
    let mut store = store(&env);
    let job_id = insert(&mut store, JobSpec::new("echo done"));

    // Still pending: the terminal update must be rejected.
    assert!(!store
        .finish(&job_id, JobState::Completed, Some(0), None)
        .unwrap());

    store.claim_one("w1").unwrap().expect("claim");
    assert!(store
        .finish(&job_id, JobState::Completed, Some(0), None)
        .unwrap());

    let job = store.get(&job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.return_code, Some(0));
    assert!(job.end_time.is_some());
    assert!(job.worker_id.is_none());
    assert!(job.pid.is_none());

    // Terminal states are absorbing.
    assert!(!store
        .finish(&job_id, JobState::Failed, Some(1), None)
        .unwrap());
}

#[test]
fn cancel_outcomes_cover_the_lifecycle() {
    let env = TestEnv::new();
    let mut store = store(&env);

    assert_eq!(
        store.cancel("job-99999999").unwrap(),
        CancelOutcome::NotFound
    );

    let pending = insert(&mut store, JobSpec::new("sleep 30"));
    assert_eq!(store.cancel(&pending).unwrap(), CancelOutcome::Cancelled);
    let job = store.get(&pending).unwrap().unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.end_time.is_some());
    assert!(job.start_time.is_none());
    assert!(job.return_code.is_none());
    assert_eq!(
        store.cancel(&pending).unwrap(),
        CancelOutcome::AlreadyTerminal
    );

    let running = insert(&mut store, JobSpec::new("sleep 30"));
    store.claim_one("w1").unwrap().expect("claim");
    assert_eq!(store.cancel(&running).unwrap(), CancelOutcome::MarkedRunning);
    let marked = store.get(&running).unwrap().unwrap();
    assert_eq!(marked.state, JobState::Cancelled);
    // The mark leaves confirmation to the owning worker.
    assert!(marked.end_time.is_none());
    assert_eq!(marked.worker_id.as_deref(), Some("w1"));
}

#[test]
fn cancel_mark_is_confirmed_once() {
    let env = TestEnv::new();
    let mut store = store(&env);
    let job_id = insert(&mut store, JobSpec::new("sleep 30"));
    store.claim_one("w1").unwrap().expect("claim");
    assert!(store.record_pid(&job_id, 4242).unwrap());
    assert_eq!(store.cancel(&job_id).unwrap(), CancelOutcome::MarkedRunning);

    assert!(store.confirm_cancel(&job_id).unwrap());
    let job = store.get(&job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.end_time.is_some());
    assert!(job.pid.is_none());
    assert!(job.worker_id.is_none());
    assert!(job.return_code.is_none());

    assert!(!store.confirm_cancel(&job_id).unwrap());
}

#[test]
fn record_pid_requires_an_active_row() {
    let env = TestEnv::new();
    let mut store = store(&env);
    let job_id = insert(&mut store, JobSpec::new("echo hi"));

    // Pending rows have no child yet.
    assert!(!store.record_pid(&job_id, 1234).unwrap());

    store.claim_one("w1").unwrap().expect("claim");
    assert!(store.record_pid(&job_id, 1234).unwrap());
    assert_eq!(store.get(&job_id).unwrap().unwrap().pid, Some(1234));

    store.finish(&job_id, JobState::Completed, Some(0), None).unwrap();
    assert!(!store.record_pid(&job_id, 5678).unwrap());
}

#[test]
fn cleanup_is_scoped_and_monotone() {
    let env = TestEnv::new();
    let mut store = store(&env);

    let done = insert(&mut store, JobSpec::new("echo done"));
    store.claim_one("w1").unwrap().expect("claim");
    store.finish(&done, JobState::Completed, Some(0), None).unwrap();

    let failed = insert(&mut store, JobSpec::new("false"));
    store.claim_one("w1").unwrap().expect("claim");
    store.finish(&failed, JobState::Failed, Some(1), None).unwrap();

    insert(&mut store, JobSpec::new("echo waiting"));

    // A one-day cutoff spares rows that just finished.
    let cutoff = chrono::Utc::now() - chrono::Duration::days(1);
    assert_eq!(store.cleanup(&[JobState::Completed], Some(cutoff)).unwrap(), 0);

    assert_eq!(store.cleanup(&[JobState::Completed], None).unwrap(), 1);
    assert_eq!(store.cleanup(&[JobState::Completed], None).unwrap(), 0);
    assert!(store.get(&done).unwrap().is_none());
    assert!(store.get(&failed).unwrap().is_some());

    // Pending rows are never in scope.
    assert!(store.cleanup(&[JobState::Pending], None).is_err());
    let counts = store.count_by_state().unwrap();
    assert_eq!(counts.get(&JobState::Pending), Some(&1));
}

#[test]
fn orphan_sweep_fails_running_rows_and_settles_cancel_marks() {
    let env = TestEnv::new();
    let mut store = store(&env);

    let mut orphans = Vec::new();
    for n in 0..5 {
        let job_id = insert(&mut store, JobSpec::new(format!("sleep {n}")));
        store.claim_one("dead-worker").unwrap().expect("claim");
        orphans.push(job_id);
    }
    let marked = insert(&mut store, JobSpec::new("sleep 60"));
    store.claim_one("dead-worker").unwrap().expect("claim");
    store.cancel(&marked).unwrap();

    assert_eq!(store.fail_orphans("orphaned by restart").unwrap(), 5);

    for job_id in &orphans {
        let job = store.get(job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error_message.as_deref(), Some("orphaned by restart"));
        assert_eq!(job.return_code, Some(-1));
        assert!(job.end_time.is_some());
        assert!(job.worker_id.is_none());
    }
    // The unconfirmed cancel got its end_time stamped, not a failure.
    let settled = store.get(&marked).unwrap().unwrap();
    assert_eq!(settled.state, JobState::Cancelled);
    assert!(settled.end_time.is_some());

    let counts = store.count_by_state().unwrap();
    assert_eq!(counts.get(&JobState::Failed), Some(&5));
    assert_eq!(counts.get(&JobState::Cancelled), Some(&1));
}

#[test]
fn scheduler_and_store_share_one_database() {
    let env = TestEnv::new();
    let mut scheduler = env.scheduler();
    let job_id = scheduler
        .submit_job(JobSpec::new("echo shared"))
        .expect("submit");

    // A raw store handle on the same file sees the scheduler's row.
    let mut store = store(&env);
    let claimed = store.claim_one("w1").unwrap().expect("claim");
    assert_eq!(claimed.job_id, job_id);

    let seen = Scheduler::open(&env.config.db_path)
        .unwrap()
        .get_job_status(&job_id)
        .unwrap()
        .unwrap();
    assert_eq!(seen.state, JobState::Running);
}
