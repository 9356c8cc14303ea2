//! Scheduler: the public API over the persistent job queue.
//!
//! All state lives in the [`store`](crate::store); the scheduler is the only
//! mutator. Callers submit, inspect and cancel jobs here; the worker pool
//! uses the internal claim/update operations. Every mutation is one store
//! transaction, so any number of scheduler instances (across processes) may
//! share one database.

pub mod job;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{Duration as ChronoDuration, Utc};

use crate::error::{Result, SchedError};
use crate::store::{CancelOutcome, JobFilter, JobStore};

pub use job::{Job, JobSpec, JobState};

/// Error message stamped on jobs found `running` with no live owner.
pub const ORPHAN_MESSAGE: &str = "orphaned by restart";

pub struct Scheduler {
    store: JobStore,
}

impl Scheduler {
    /// Open the scheduler database at `db_path`, creating it if needed.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            store: JobStore::open(db_path)?,
        })
    }

    /// Submit a job to the queue and return its assigned id.
    ///
    /// Validates the spec, defaults `working_dir` to the caller's current
    /// directory and `user` to the invoking system user, and inserts the row
    /// in `pending`.
    pub fn submit_job(&mut self, spec: JobSpec) -> Result<String> {
        if spec.command.trim().is_empty() {
            return Err(SchedError::InvalidArgument(
                "command must not be empty".to_string(),
            ));
        }
        if spec.cpus < 1 {
            return Err(SchedError::InvalidArgument(
                "cpus must be at least 1".to_string(),
            ));
        }
        if let Some(timeout) = spec.timeout_seconds {
            if timeout < 1 {
                return Err(SchedError::InvalidArgument(
                    "timeout_seconds must be positive".to_string(),
                ));
            }
        }

        let mut spec = spec;
        if spec.working_dir.is_none() {
            spec.working_dir = std::env::current_dir()
                .ok()
                .map(|dir| dir.display().to_string());
        }
        let user = current_user();

        let job = self.store.insert(&spec, &user)?;
        tracing::info!(
            job_id = %job.job_id,
            job_name = ?job.job_name,
            priority = job.priority,
            "job submitted"
        );
        Ok(job.job_id)
    }

    /// Full record for one job, or `None` when the id is unknown.
    pub fn get_job_status(&self, job_id: &str) -> Result<Option<Job>> {
        self.store.get(job_id)
    }

    /// Cancel a job. Pending jobs are cancelled outright; running jobs are
    /// marked and their worker kills the subprocess. Returns false when the
    /// job is unknown or already terminal.
    pub fn cancel_job(&mut self, job_id: &str) -> Result<bool> {
        match self.store.cancel(job_id)? {
            CancelOutcome::Cancelled => {
                tracing::info!(job_id, "pending job cancelled");
                Ok(true)
            }
            CancelOutcome::MarkedRunning => {
                tracing::info!(job_id, "running job marked for cancellation");
                Ok(true)
            }
            CancelOutcome::AlreadyTerminal => {
                tracing::warn!(job_id, "cancel ignored, job already terminal");
                Ok(false)
            }
            CancelOutcome::NotFound => {
                tracing::warn!(job_id, "cancel ignored, job not found");
                Ok(false)
            }
        }
    }

    /// List jobs, newest submission first.
    pub fn list_jobs(
        &self,
        state: Option<JobState>,
        user: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>> {
        self.store.query(&JobFilter {
            state,
            user: user.map(str::to_owned),
            limit,
        })
    }

    pub fn count_by_state(&self) -> Result<BTreeMap<JobState, i64>> {
        self.store.count_by_state()
    }

    /// Delete a finished job. Refuses pending and running rows; returns
    /// false when the id is unknown.
    pub fn delete_job(&mut self, job_id: &str) -> Result<bool> {
        let deleted = self.store.delete(job_id)?;
        if deleted {
            tracing::info!(job_id, "job deleted");
        }
        Ok(deleted)
    }

    /// Bulk-delete terminal jobs, optionally only those that ended more than
    /// `older_than_days` ago. Returns the number removed.
    pub fn cleanup(&mut self, states: &[JobState], older_than_days: Option<i64>) -> Result<usize> {
        if let Some(days) = older_than_days {
            if days < 0 {
                return Err(SchedError::InvalidArgument(
                    "older_than_days must not be negative".to_string(),
                ));
            }
        }
        let cutoff = older_than_days.map(|days| Utc::now() - ChronoDuration::days(days));
        let removed = self.store.cleanup(states, cutoff)?;
        tracing::info!(removed, "cleanup finished");
        Ok(removed)
    }

    /// Worker-internal: atomically claim the best pending job for
    /// `worker_id`.
    pub fn claim_next(&mut self, worker_id: &str) -> Result<Option<Job>> {
        let claimed = self.store.claim_one(worker_id)?;
        if let Some(job) = &claimed {
            tracing::debug!(
                job_id = %job.job_id,
                worker_id,
                priority = job.priority,
                "job claimed"
            );
        }
        Ok(claimed)
    }

    /// Worker-internal: apply a state mutation on behalf of a worker.
    ///
    /// `Running` with a pid records the spawned child (the state does not
    /// change); terminal states close the job out. Transitions out of a
    /// terminal state are rejected as [`SchedError::IllegalTransition`];
    /// workers treat that as having lost a race against a cancel.
    pub fn update_job_state(
        &mut self,
        job_id: &str,
        new_state: JobState,
        return_code: Option<i32>,
        error_message: Option<&str>,
        pid: Option<u32>,
    ) -> Result<()> {
        match new_state {
            JobState::Pending => Err(SchedError::IllegalTransition(
                "jobs cannot return to pending".to_string(),
            )),
            JobState::Running => {
                let Some(pid) = pid else {
                    return Err(SchedError::InvalidArgument(
                        "a running update must carry a pid".to_string(),
                    ));
                };
                if self.store.record_pid(job_id, pid)? {
                    Ok(())
                } else {
                    Err(SchedError::IllegalTransition(format!(
                        "job {job_id} is not active"
                    )))
                }
            }
            state => {
                // Cancelled rows never carry a return code.
                let return_code = if state == JobState::Cancelled {
                    None
                } else {
                    return_code
                };
                if self.store.finish(job_id, state, return_code, error_message)? {
                    Ok(())
                } else {
                    Err(SchedError::IllegalTransition(format!(
                        "job {job_id} is not running"
                    )))
                }
            }
        }
    }

    /// Worker-internal: record where the job's streams were redirected when
    /// the submitter left the paths unset.
    pub fn record_output_paths(
        &mut self,
        job_id: &str,
        stdout_path: &str,
        stderr_path: &str,
    ) -> Result<()> {
        self.store
            .record_output_paths(job_id, stdout_path, stderr_path)
    }

    /// Worker-internal: finalize a cancel mark after the child is reaped.
    pub fn confirm_cancel(&mut self, job_id: &str) -> Result<bool> {
        self.store.confirm_cancel(job_id)
    }

    /// Resolve jobs left `running` by a previous pool instance. Called once
    /// on pool start, before any worker claims.
    pub fn fail_orphans(&mut self) -> Result<usize> {
        let failed = self.store.fail_orphans(ORPHAN_MESSAGE)?;
        if failed > 0 {
            tracing::warn!(failed, "orphaned running jobs marked failed");
        }
        Ok(failed)
    }
}

static DEFAULT: OnceLock<Arc<Mutex<Scheduler>>> = OnceLock::new();

/// Initialize the process-wide default scheduler, or return the existing one
/// if a caller already did. Library users who want isolation should construct
/// [`Scheduler`] instances directly.
pub fn init_default(db_path: impl AsRef<Path>) -> Result<Arc<Mutex<Scheduler>>> {
    if let Some(existing) = DEFAULT.get() {
        return Ok(existing.clone());
    }
    let scheduler = Arc::new(Mutex::new(Scheduler::open(db_path)?));
    Ok(DEFAULT.get_or_init(|| scheduler).clone())
}

/// The process-wide default scheduler, if one has been initialized.
pub fn default_instance() -> Option<Arc<Mutex<Scheduler>>> {
    DEFAULT.get().cloned()
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
