//! Worker pool: long-lived tasks that claim and execute jobs.
//!
//! Each worker owns its own [`Scheduler`] (and therefore its own database
//! connection), so claim atomicity rests entirely on the store's
//! transactions. The pool only keeps a small `{worker_id -> current job}`
//! table behind a mutex for status reporting.
//!
//! # Execution flow
//!
//! 1. A worker polls [`Scheduler::claim_next`]; idle workers sleep one poll
//!    interval with early wake on shutdown.
//! 2. The claimed command is spawned as `sh -c <command>` in its own process
//!    group, streams redirected to the job's log files.
//! 3. A supervision loop watches for child exit, timeout, and cancel marks,
//!    and always records a terminal state.

mod worker;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Result, SchedError};
use crate::scheduler::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Running,
}

/// Per-worker view reported by [`WorkerPool::worker_status`].
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub state: WorkerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_job: Option<String>,
}

/// Shared bookkeeping of which worker holds which job.
#[derive(Debug, Clone, Default)]
pub(crate) struct SlotTable {
    slots: Arc<Mutex<HashMap<String, Option<String>>>>,
}

impl SlotTable {
    fn register(&self, worker_id: &str) {
        self.lock().insert(worker_id.to_string(), None);
    }

    pub(crate) fn set_running(&self, worker_id: &str, job_id: &str) {
        self.lock()
            .insert(worker_id.to_string(), Some(job_id.to_string()));
    }

    pub(crate) fn set_idle(&self, worker_id: &str) {
        self.lock().insert(worker_id.to_string(), None);
    }

    fn running_jobs(&self) -> Vec<String> {
        self.lock().values().flatten().cloned().collect()
    }

    fn snapshot(&self) -> Vec<WorkerStatus> {
        let mut statuses: Vec<WorkerStatus> = self
            .lock()
            .iter()
            .map(|(worker_id, current_job)| WorkerStatus {
                worker_id: worker_id.clone(),
                state: if current_job.is_some() {
                    WorkerState::Running
                } else {
                    WorkerState::Idle
                },
                current_job: current_job.clone(),
            })
            .collect();
        statuses.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        statuses
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Option<String>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct WorkerPool {
    config: Config,
    slots: SlotTable,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            slots: SlotTable::default(),
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Number of configured worker slots.
    pub fn worker_count(&self) -> usize {
        self.config.max_workers
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Sweep orphans left by a previous instance, then launch the workers.
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(SchedError::Service("worker pool already running".to_string()));
        }

        let mut scheduler = Scheduler::open(&self.config.db_path)?;
        scheduler.fail_orphans()?;

        self.shutdown = CancellationToken::new();
        self.slots = SlotTable::default();
        for index in 0..self.config.max_workers {
            let worker_id = worker_id(index);
            self.slots.register(&worker_id);
            self.handles.push(tokio::spawn(worker::run_worker(
                worker_id,
                self.config.clone(),
                self.slots.clone(),
                self.shutdown.clone(),
            )));
        }
        tracing::info!(
            workers = self.config.max_workers,
            db = %self.config.db_path.display(),
            "worker pool started"
        );
        Ok(())
    }

    /// Stop the pool. With `drain`, in-flight jobs may finish within
    /// `timeout`; without it they are cancelled and their workers kill the
    /// subprocesses.
    pub async fn stop(&mut self, drain: bool, timeout: Duration) -> Result<()> {
        if self.handles.is_empty() {
            return Ok(());
        }
        tracing::info!(drain, "stopping worker pool");
        self.shutdown.cancel();

        if !drain {
            let mut scheduler = Scheduler::open(&self.config.db_path)?;
            for job_id in self.slots.running_jobs() {
                if let Err(err) = scheduler.cancel_job(&job_id) {
                    tracing::error!(job_id = %job_id, error = %err, "cancel failed during stop");
                }
            }
        }

        let mut handles = std::mem::take(&mut self.handles);
        let join_all = async {
            for handle in handles.iter_mut() {
                let _ = handle.await;
            }
        };
        let drained = tokio::time::timeout(timeout, join_all).await.is_ok();
        if !drained {
            tracing::warn!("stop timeout elapsed, aborting workers");
            for handle in &handles {
                handle.abort();
            }
        }
        tracing::info!("worker pool stopped");
        Ok(())
    }

    pub fn worker_status(&self) -> Vec<WorkerStatus> {
        self.slots.snapshot()
    }
}

fn worker_id(index: usize) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("worker-{}-{}", index + 1, &suffix[..8])
}
