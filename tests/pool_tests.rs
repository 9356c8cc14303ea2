
use std::time::Duration;

use schedarray::pool::{WorkerPool, WorkerState};
use schedarray::scheduler::{JobSpec, JobState, ORPHAN_MESSAGE};
use test_harness::{submit, wait_for_state, TestEnv};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn happy_path_runs_a_job_to_completion() {
    let env = TestEnv::new();
    let mut scheduler = env.scheduler();
    let job_id = submit(&mut scheduler, "echo hello");

    let mut pool = WorkerPool::new(env.config.clone());
    pool.start().expect("start pool");

    let job = wait_for_state(&env, &job_id, JobState::Completed, WAIT).await;
    assert_eq!(job.return_code, Some(0));
    assert!(job.worker_id.is_none());
    assert!(job.pid.is_none());

    let start = job.start_time.expect("start_time");
    let end = job.end_time.expect("end_time");
    assert!(job.submit_time <= start && start <= end);

    let stdout_path = job.stdout_path.expect("stdout path recorded");
    let stdout = std::fs::read_to_string(&stdout_path).expect("read stdout file");
    assert_eq!(stdout, "hello\n");

    pool.stop(true, WAIT).await.expect("stop pool");
}

#[tokio::test]
async fn nonzero_exit_is_recorded_as_failed() {
    let env = TestEnv::new();
    let mut scheduler = env.scheduler();
    let job_id = submit(&mut scheduler, "exit 3");

    let mut pool = WorkerPool::new(env.config.clone());
    pool.start().expect("start pool");

    let job = wait_for_state(&env, &job_id, JobState::Failed, WAIT).await;
    assert_eq!(job.return_code, Some(3));

    pool.stop(true, WAIT).await.expect("stop pool");
}

#[tokio::test]
async fn explicit_output_paths_are_honored() {
    let env = TestEnv::new();
    let out = env.config.db_path.with_file_name("explicit.out");
    let mut scheduler = env.scheduler();
    let job_id = scheduler
        .submit_job(JobSpec {
            stdout_path: Some(out.display().to_string()),
            ..JobSpec::new("echo routed")
        })
        .expect("submit");

    let mut pool = WorkerPool::new(env.config.clone());
    pool.start().expect("start pool");

    let job = wait_for_state(&env, &job_id, JobState::Completed, WAIT).await;
    assert_eq!(job.stdout_path.as_deref(), Some(out.display().to_string().as_str()));
    assert_eq!(
        std::fs::read_to_string(&out).expect("read explicit stdout"),
        "routed\n"
    );
    // The defaulted stderr side still lands in the log dir.
    assert!(job.stderr_path.expect("stderr path").contains(&job.job_id));

    pool.stop(true, WAIT).await.expect("stop pool");
}

#[tokio::test]
async fn cancelling_a_running_job_kills_the_child() {
    let env = TestEnv::new();
    let mut scheduler = env.scheduler();
    let job_id = submit(&mut scheduler, "sleep 30");

    let mut pool = WorkerPool::new(env.config.clone());
    pool.start().expect("start pool");

    let running = wait_for_state(&env, &job_id, JobState::Running, WAIT).await;
    assert!(running.worker_id.is_some());

    assert!(scheduler.cancel_job(&job_id).expect("cancel"));
    let deadline = std::time::Instant::now() + WAIT;
    let job = loop {
        let job = scheduler
            .get_job_status(&job_id)
            .expect("get job")
            .expect("job exists");
        if job.state == JobState::Cancelled && job.end_time.is_some() {
            break job;
        }
        assert!(std::time::Instant::now() < deadline, "cancel never confirmed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert!(job.return_code.is_none());
    assert!(job.pid.is_none());

    pool.stop(true, WAIT).await.expect("stop pool");
}

#[tokio::test]
async fn timeout_kills_the_job_within_bounds() {
    let env = TestEnv::new();
    let mut scheduler = env.scheduler();
    let job_id = scheduler
        .submit_job(JobSpec {
            timeout_seconds: Some(1),
            ..JobSpec::new("sleep 10")
        })
        .expect("submit");

    let mut pool = WorkerPool::new(env.config.clone());
    pool.start().expect("start pool");

    let job = wait_for_state(&env, &job_id, JobState::Timeout, WAIT).await;
    assert_eq!(job.return_code, Some(-1));

    let elapsed = job.end_time.expect("end_time") - job.start_time.expect("start_time");
    assert!(elapsed >= chrono::Duration::seconds(1));
    assert!(elapsed <= chrono::Duration::seconds(6), "elapsed: {elapsed}");

    pool.stop(true, WAIT).await.expect("stop pool");
}

#[tokio::test]
async fn missing_working_dir_fails_the_job() {
    let env = TestEnv::new();
    let mut scheduler = env.scheduler();
    let job_id = scheduler
        .submit_job(JobSpec {
            working_dir: Some("/definitely/not/here".to_string()),
            ..JobSpec::new("echo unreachable")
        })
        .expect("submit");

    let mut pool = WorkerPool::new(env.config.clone());
    pool.start().expect("start pool");

    let job = wait_for_state(&env, &job_id, JobState::Failed, WAIT).await;
    assert_eq!(job.return_code, Some(-1));
    assert!(job
        .error_message
        .expect("error message")
        .contains("working directory"));

    pool.stop(true, WAIT).await.expect("stop pool");
}

#[tokio::test]
async fn pool_start_fails_orphans_before_claiming() {
    let env = TestEnv::new();
    let mut scheduler = env.scheduler();
    let job_id = submit(&mut scheduler, "sleep 600");
    // Simulate a claim whose pool died before finishing.
    scheduler.claim_next("worker-of-a-dead-pool").unwrap().expect("claim");

    let mut pool = WorkerPool::new(env.config.clone());
    pool.start().expect("start pool");

    let job = wait_for_state(&env, &job_id, JobState::Failed, WAIT).await;
    assert_eq!(job.error_message.as_deref(), Some(ORPHAN_MESSAGE));
    assert_eq!(job.return_code, Some(-1));

    let counts = scheduler.count_by_state().expect("counts");
    assert_eq!(counts.get(&JobState::Failed), Some(&1));
    assert_eq!(counts.get(&JobState::Running), None);

    pool.stop(true, WAIT).await.expect("stop pool");
}

#[tokio::test]
async fn jobs_submitted_while_stopped_start_on_next_pool_start() {
    let env = TestEnv::new();
    let mut scheduler = env.scheduler();
    let job_id = submit(&mut scheduler, "echo delayed");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let job = scheduler.get_job_status(&job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending, "no pool, nothing claims");

    let mut pool = WorkerPool::new(env.config.clone());
    pool.start().expect("start pool");
    wait_for_state(&env, &job_id, JobState::Completed, WAIT).await;
    pool.stop(true, WAIT).await.expect("stop pool");
}

#[tokio::test]
async fn drain_stop_lets_the_running_job_finish() {
    let env = TestEnv::new();
    let mut scheduler = env.scheduler();
    let job_id = submit(&mut scheduler, "sleep 1 && echo drained");

    let mut pool = WorkerPool::new(env.config.clone());
    pool.start().expect("start pool");
    wait_for_state(&env, &job_id, JobState::Running, WAIT).await;

    pool.stop(true, WAIT).await.expect("drain stop");

    let job = scheduler.get_job_status(&job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.return_code, Some(0));
}

#[tokio::test]
async fn immediate_stop_cancels_the_running_job() {
    let env = TestEnv::new();
    let mut scheduler = env.scheduler();
    let job_id = submit(&mut scheduler, "sleep 30");

    let mut pool = WorkerPool::new(env.config.clone());
    pool.start().expect("start pool");
    wait_for_state(&env, &job_id, JobState::Running, WAIT).await;

    pool.stop(false, WAIT).await.expect("immediate stop");

    let job = scheduler.get_job_status(&job_id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert!(job.end_time.is_some());
    assert!(job.return_code.is_none());
}

#[tokio::test]
async fn worker_status_reports_every_slot() {
    let env = TestEnv::new();
    let config = env.config.clone().with_max_workers(2);

    let mut pool = WorkerPool::new(config);
    pool.start().expect("start pool");

    let statuses = pool.worker_status();
    assert_eq!(statuses.len(), 2);
    let mut ids: Vec<&str> = statuses.iter().map(|s| s.worker_id.as_str()).collect();
    ids.dedup();
    assert_eq!(ids.len(), 2);
    for status in &statuses {
        assert_eq!(status.state, WorkerState::Idle);
        assert!(status.current_job.is_none());
    }

    pool.stop(true, WAIT).await.expect("stop pool");
}
