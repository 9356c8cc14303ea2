use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::time::{interval, sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::pool::SlotTable;
use crate::scheduler::{Job, JobState, Scheduler};

/// Grace between SIGTERM and SIGKILL when tearing a job down.
const KILL_GRACE: Duration = Duration::from_secs(2);
/// Supervision tick: cancellation and timeouts are observed at least this
/// often while a job runs.
const SUPERVISION_TICK: Duration = Duration::from_secs(1);

/// A single worker: claim, execute, record, repeat until the token fires.
pub(crate) async fn run_worker(
    worker_id: String,
    config: Config,
    slots: SlotTable,
    shutdown: CancellationToken,
) {
    let mut scheduler = match Scheduler::open(&config.db_path) {
        Ok(scheduler) => scheduler,
        Err(err) => {
            tracing::error!(worker_id = %worker_id, error = %err, "worker failed to open store, exiting");
            return;
        }
    };
    tracing::debug!(worker_id = %worker_id, "worker started");

    while !shutdown.is_cancelled() {
        match scheduler.claim_next(&worker_id) {
            Ok(Some(job)) => {
                slots.set_running(&worker_id, &job.job_id);
                execute_job(&mut scheduler, &config, &job).await;
                slots.set_idle(&worker_id);
            }
            Ok(None) => idle_wait(&config, &shutdown).await,
            Err(err) => {
                // Back off one poll so a broken store does not spin the loop.
                tracing::error!(worker_id = %worker_id, error = %err, "claim failed");
                idle_wait(&config, &shutdown).await;
            }
        }
    }

    tracing::debug!(worker_id = %worker_id, "worker stopped");
}

async fn idle_wait(config: &Config, shutdown: &CancellationToken) {
    tokio::select! {
        _ = sleep(config.poll_interval) => {}
        _ = shutdown.cancelled() => {}
    }
}

async fn execute_job(scheduler: &mut Scheduler, config: &Config, job: &Job) {
    tracing::info!(job_id = %job.job_id, command = %job.command, "executing job");

    let stdout_path = output_path(job.stdout_path.as_deref(), config, &job.job_id, "out");
    let stderr_path = output_path(job.stderr_path.as_deref(), config, &job.job_id, "err");
    if job.stdout_path.is_none() || job.stderr_path.is_none() {
        if let Err(err) = scheduler.record_output_paths(
            &job.job_id,
            &stdout_path.display().to_string(),
            &stderr_path.display().to_string(),
        ) {
            tracing::warn!(job_id = %job.job_id, error = %err, "output paths not recorded");
        }
    }

    let mut child = match spawn_child(job, &stdout_path, &stderr_path) {
        Ok(child) => child,
        Err(err) => {
            tracing::error!(job_id = %job.job_id, error = %err, "failed to spawn job");
            report(
                scheduler,
                &job.job_id,
                JobState::Failed,
                Some(-1),
                Some(&err.to_string()),
            );
            return;
        }
    };

    if let Some(pid) = child.id() {
        if let Err(err) = scheduler.update_job_state(&job.job_id, JobState::Running, None, None, Some(pid))
        {
            // A cancel can land between the claim and the spawn; the first
            // supervision tick picks the mark up and kills the child.
            tracing::debug!(job_id = %job.job_id, error = %err, "pid not recorded");
        }
    }

    supervise(scheduler, job, &mut child).await;
}

fn spawn_child(job: &Job, stdout_path: &Path, stderr_path: &Path) -> Result<Child> {
    let stdout = open_log(stdout_path)?;
    let stderr = open_log(stderr_path)?;

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(&job.command)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        // New process group, so the kill protocol reaches the whole tree.
        .process_group(0);
    if let Some(dir) = &job.working_dir {
        if !Path::new(dir).is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("working directory does not exist: {dir}"),
            )
            .into());
        }
        command.current_dir(dir);
    }
    Ok(command.spawn()?)
}

fn output_path(explicit: Option<&str>, config: &Config, job_id: &str, ext: &str) -> PathBuf {
    match explicit {
        Some(path) => PathBuf::from(path),
        None => config.log_dir().join(format!("{job_id}.{ext}")),
    }
}

fn open_log(path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(std::fs::File::create(path)?)
}

/// Watch the child until it exits, its deadline passes, or a cancel mark
/// appears in the store. Always leaves the job in a terminal state.
async fn supervise(scheduler: &mut Scheduler, job: &Job, child: &mut Child) {
    let deadline = job.timeout_seconds.map(|secs| {
        // Wall clock from the claim's start_time, not from the spawn.
        let started = job.start_time.unwrap_or_else(Utc::now);
        let ends = started + chrono::Duration::seconds(secs);
        let remaining = (ends - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        Instant::now() + remaining
    });
    let mut tick = interval(SUPERVISION_TICK);

    loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => {
                        let code = exit_code(&status);
                        let state = if status.success() {
                            JobState::Completed
                        } else {
                            JobState::Failed
                        };
                        tracing::info!(job_id = %job.job_id, exit_code = code, state = %state, "job finished");
                        if !report(scheduler, &job.job_id, state, Some(code), None) {
                            // Lost the race against a cancel that committed
                            // just before the exit: confirm it instead.
                            if let Err(err) = scheduler.confirm_cancel(&job.job_id) {
                                tracing::error!(job_id = %job.job_id, error = %err, "cancel not confirmed");
                            }
                        }
                    }
                    Err(err) => {
                        tracing::error!(job_id = %job.job_id, error = %err, "wait failed");
                        report(scheduler, &job.job_id, JobState::Failed, Some(-1), Some(&err.to_string()));
                    }
                }
                return;
            }
            _ = tick.tick() => {
                if cancel_requested(scheduler, &job.job_id) {
                    tracing::info!(job_id = %job.job_id, "cancel observed, killing job");
                    kill_and_reap(child).await;
                    match scheduler.confirm_cancel(&job.job_id) {
                        Ok(_) => {}
                        Err(err) => tracing::error!(job_id = %job.job_id, error = %err, "cancel not confirmed"),
                    }
                    return;
                }
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    tracing::warn!(job_id = %job.job_id, timeout_seconds = job.timeout_seconds, "job timed out");
                    kill_and_reap(child).await;
                    report(
                        scheduler,
                        &job.job_id,
                        JobState::Timeout,
                        Some(-1),
                        Some("wall-clock timeout exceeded"),
                    );
                    return;
                }
            }
        }
    }
}

fn cancel_requested(scheduler: &Scheduler, job_id: &str) -> bool {
    matches!(
        scheduler.get_job_status(job_id),
        Ok(Some(job)) if job.state == JobState::Cancelled
    )
}

/// SIGTERM the process group, give it a short grace, then SIGKILL and reap.
async fn kill_and_reap(child: &mut Child) {
    if let Some(pid) = child.id() {
        let group = Pid::from_raw(pid as i32);
        if let Err(err) = killpg(group, Signal::SIGTERM) {
            tracing::debug!(pid, error = %err, "SIGTERM failed");
        }
        if timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        if let Err(err) = killpg(group, Signal::SIGKILL) {
            tracing::debug!(pid, error = %err, "SIGKILL failed");
        }
    }
    if let Err(err) = child.wait().await {
        tracing::error!(error = %err, "failed to reap child");
    }
}

/// Push a terminal state through the scheduler; false means the transition
/// was rejected (the row already left `running`).
fn report(
    scheduler: &mut Scheduler,
    job_id: &str,
    state: JobState,
    return_code: Option<i32>,
    error_message: Option<&str>,
) -> bool {
    match scheduler.update_job_state(job_id, state, return_code, error_message, None) {
        Ok(()) => true,
        Err(err) => {
            tracing::debug!(job_id, state = %state, error = %err, "terminal update rejected");
            false
        }
    }
}

fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(-1)
}
