//! Service: a process-level lifecycle wrapper around one scheduler and one
//! worker pool, guarded by a pid-file lock so only a single instance runs
//! against a database at a time.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;

use crate::config::Config;
use crate::error::{Result, SchedError};
use crate::pool::{WorkerPool, WorkerStatus};
use crate::scheduler::{JobState, Scheduler};
use crate::shutdown;

/// Snapshot returned by [`Service::status`] and `service status`.
#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<Vec<WorkerStatus>>,
    pub jobs: BTreeMap<JobState, i64>,
}

/// Exclusive pid-file lock. Holding the value means this process is the
/// service instance; the file is removed on drop.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    /// Take the lock, reclaiming stale files whose recorded owner is gone.
    pub fn acquire(path: PathBuf) -> Result<Self> {
        if let Some(owner) = read_owner(&path) {
            if process_alive(owner) {
                return Err(SchedError::Service(format!(
                    "service already running (pid {owner})"
                )));
            }
            tracing::warn!(pid = owner, path = %path.display(), "reclaiming stale pid file");
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(Self { path })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub struct Service {
    config: Config,
    pool: WorkerPool,
}

impl Service {
    pub fn new(config: Config) -> Self {
        Self {
            pool: WorkerPool::new(config.clone()),
            config,
        }
    }

    /// Run the service in the foreground: lock, start the pool, block until
    /// SIGTERM/SIGINT, then drain.
    pub async fn run(&mut self) -> Result<()> {
        let _lock = PidLock::acquire(self.config.pid_path())?;
        self.pool.start()?;
        tracing::info!(
            pid = std::process::id(),
            workers = self.pool.worker_count(),
            "service started"
        );

        let token = shutdown::install_shutdown_handler();
        token.cancelled().await;

        self.pool.stop(true, self.config.drain_timeout).await?;
        tracing::info!("service stopped");
        Ok(())
    }

    /// In-process status, including per-worker detail.
    pub fn status(&self) -> Result<ServiceStatus> {
        let scheduler = Scheduler::open(&self.config.db_path)?;
        Ok(ServiceStatus {
            running: self.pool.is_running(),
            pid: Some(std::process::id()),
            worker_count: Some(self.pool.worker_count()),
            workers: Some(self.pool.worker_status()),
            jobs: scheduler.count_by_state()?,
        })
    }

    /// Cross-process status derived from the pid file and the store. Worker
    /// detail is only known inside the service process.
    pub fn probe(config: &Config) -> Result<ServiceStatus> {
        let owner = read_owner(&config.pid_path()).filter(|pid| process_alive(*pid));
        let scheduler = Scheduler::open(&config.db_path)?;
        Ok(ServiceStatus {
            running: owner.is_some(),
            pid: owner,
            worker_count: None,
            workers: None,
            jobs: scheduler.count_by_state()?,
        })
    }

    /// Ask a running service to stop. Returns false when no live process
    /// holds the lock; stale pid files are cleared on the way.
    pub fn signal_stop(config: &Config) -> Result<bool> {
        let path = config.pid_path();
        let Some(owner) = read_owner(&path) else {
            return Ok(false);
        };
        if !process_alive(owner) {
            let _ = fs::remove_file(&path);
            return Ok(false);
        }
        kill(Pid::from_raw(owner as i32), Signal::SIGTERM).map_err(|err| {
            SchedError::Service(format!("failed to signal pid {owner}: {err}"))
        })?;
        tracing::info!(pid = owner, "stop signal sent");
        Ok(true)
    }
}

fn read_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Signal-0 probe: the pid refers to a live process (EPERM still means
/// alive, just owned by someone else).
fn process_alive(pid: u32) -> bool {
    matches!(
        kill(Pid::from_raw(pid as i32), None),
        Ok(()) | Err(Errno::EPERM)
    )
}
