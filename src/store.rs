//! SQLite-backed job store.
//!
//! Every mutating operation runs as a single `BEGIN IMMEDIATE` transaction,
//! so concurrent workers and CLI processes coordinate purely through SQLite's
//! write lock. [`JobStore::claim_one`] relies on this for its exactly-once
//! guarantee: the candidate select and the state flip commit together or not
//! at all.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, Transaction,
    TransactionBehavior,
};

use crate::error::{Result, SchedError};
use crate::scheduler::job::{Job, JobSpec, JobState};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const JOB_SEQ: &str = "job_seq";

const JOB_COLUMNS: &str = "job_id, job_name, command, working_dir, cpus, memory, \
     timeout_seconds, priority, user, state, return_code, stdout_path, stderr_path, \
     submit_time, start_time, end_time, worker_id, pid, error_message, metadata";

/// Filter for [`JobStore::query`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub user: Option<String>,
    pub limit: Option<usize>,
}

/// What a cancel request did to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// No row with that id.
    NotFound,
    /// The job already reached a terminal state.
    AlreadyTerminal,
    /// A pending job was cancelled outright.
    Cancelled,
    /// A running job was marked; the owning worker kills and confirms.
    MarkedRunning,
}

#[derive(Debug)]
pub struct JobStore {
    db_path: PathBuf,
    conn: Connection,
}

impl JobStore {
    /// Open the store, creating the database file and schema if needed.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self { db_path, conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS counters (
              name TEXT PRIMARY KEY,
              value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS job_queue (
              job_id TEXT PRIMARY KEY,
              job_name TEXT,
              command TEXT NOT NULL,
              working_dir TEXT,
              cpus INTEGER NOT NULL DEFAULT 1,
              memory TEXT,
              timeout_seconds INTEGER,
              priority INTEGER NOT NULL DEFAULT 0,
              user TEXT NOT NULL,
              state TEXT NOT NULL,
              return_code INTEGER,
              stdout_path TEXT,
              stderr_path TEXT,
              submit_time TEXT NOT NULL,
              start_time TEXT,
              end_time TEXT,
              worker_id TEXT,
              pid INTEGER,
              error_message TEXT,
              metadata TEXT
            );

            -- Reserved for a future distributed mode; created but never written.
            CREATE TABLE IF NOT EXISTS worker_nodes (
              worker_id TEXT PRIMARY KEY,
              hostname TEXT NOT NULL,
              platform TEXT NOT NULL,
              max_cpus INTEGER,
              available_cpus INTEGER,
              max_memory TEXT,
              available_memory TEXT,
              state TEXT NOT NULL,
              last_heartbeat TEXT,
              registered_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS resource_usage (
              usage_id TEXT PRIMARY KEY,
              job_id TEXT NOT NULL,
              worker_id TEXT NOT NULL,
              cpu_usage REAL,
              memory_usage TEXT,
              timestamp TEXT NOT NULL,
              FOREIGN KEY (job_id) REFERENCES job_queue(job_id)
            );

            CREATE INDEX IF NOT EXISTS idx_job_queue_state ON job_queue(state);
            CREATE INDEX IF NOT EXISTS idx_job_queue_claim ON job_queue(priority DESC, submit_time ASC);
            CREATE INDEX IF NOT EXISTS idx_job_queue_user ON job_queue(user);
            "#,
        )?;
        Ok(())
    }

    /// Insert a new pending job. The id is drawn from a counter inside the
    /// same transaction, so ids are unique and monotonic within a store.
    pub fn insert(&mut self, spec: &JobSpec, user: &str) -> Result<Job> {
        let now = Utc::now();
        let tx = self.write_tx()?;
        let seq = next_counter_tx(&tx, JOB_SEQ)?;
        let job_id = format!("job-{seq:08}");
        tx.execute(
            r#"
            INSERT INTO job_queue (
              job_id, job_name, command, working_dir, cpus, memory,
              timeout_seconds, priority, user, state, stdout_path, stderr_path,
              submit_time, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                job_id,
                spec.job_name,
                spec.command,
                spec.working_dir,
                spec.cpus,
                spec.memory,
                spec.timeout_seconds,
                spec.priority,
                user,
                JobState::Pending.as_str(),
                spec.stdout_path,
                spec.stderr_path,
                encode_time(now),
                spec.metadata.as_ref().map(|meta| meta.to_string()),
            ],
        )?;
        tx.commit()?;
        Ok(Job {
            job_id,
            job_name: spec.job_name.clone(),
            command: spec.command.clone(),
            working_dir: spec.working_dir.clone(),
            cpus: spec.cpus,
            memory: spec.memory.clone(),
            timeout_seconds: spec.timeout_seconds,
            priority: spec.priority,
            user: user.to_string(),
            state: JobState::Pending,
            return_code: None,
            stdout_path: spec.stdout_path.clone(),
            stderr_path: spec.stderr_path.clone(),
            submit_time: now,
            start_time: None,
            end_time: None,
            worker_id: None,
            pid: None,
            error_message: None,
            metadata: spec.metadata.clone(),
        })
    }

    pub fn get(&self, job_id: &str) -> Result<Option<Job>> {
        get_on(&self.conn, job_id)
    }

    /// Jobs matching `filter`, newest submission first.
    pub fn query(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE 1=1");
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(state) = filter.state {
            sql.push_str(" AND state = ?");
            args.push(SqlValue::Text(state.as_str().to_string()));
        }
        if let Some(user) = &filter.user {
            sql.push_str(" AND user = ?");
            args.push(SqlValue::Text(user.clone()));
        }
        sql.push_str(" ORDER BY submit_time DESC, job_id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            args.push(SqlValue::Integer(limit as i64));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), job_from_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    pub fn count_by_state(&self) -> Result<BTreeMap<JobState, i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT state, COUNT(*) FROM job_queue GROUP BY state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (raw, count) = row?;
            counts.insert(raw.parse::<JobState>()?, count);
        }
        Ok(counts)
    }

    /// Atomically move the best pending job to `running` on behalf of
    /// `worker_id`: highest priority first, earliest submission breaking
    /// ties. Returns `None` without side effects when nothing is pending.
    pub fn claim_one(&mut self, worker_id: &str) -> Result<Option<Job>> {
        let now = Utc::now();
        let tx = self.write_tx()?;
        let candidate: Option<String> = tx
            .query_row(
                "SELECT job_id FROM job_queue WHERE state = ?1 \
                 ORDER BY priority DESC, submit_time ASC, job_id ASC LIMIT 1",
                params![JobState::Pending.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(job_id) = candidate else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE job_queue SET state = ?1, worker_id = ?2, start_time = ?3 \
             WHERE job_id = ?4",
            params![
                JobState::Running.as_str(),
                worker_id,
                encode_time(now),
                job_id
            ],
        )?;
        let claimed = get_on(&tx, &job_id)?;
        tx.commit()?;
        Ok(claimed)
    }

    /// Record the spawned child's pid. Also matches a fresh cancel mark (the
    /// row is mid-kill and still owned), so the pid stays visible to anyone
    /// inspecting the queue while the worker tears the child down.
    pub fn record_pid(&mut self, job_id: &str, pid: u32) -> Result<bool> {
        let tx = self.write_tx()?;
        let changed = tx.execute(
            "UPDATE job_queue SET pid = ?1 \
             WHERE job_id = ?2 AND state IN (?3, ?4) AND end_time IS NULL",
            params![
                pid as i64,
                job_id,
                JobState::Running.as_str(),
                JobState::Cancelled.as_str()
            ],
        )?;
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Record where the worker redirected the job's streams, without
    /// overwriting paths the submitter chose.
    pub fn record_output_paths(
        &mut self,
        job_id: &str,
        stdout_path: &str,
        stderr_path: &str,
    ) -> Result<()> {
        let tx = self.write_tx()?;
        tx.execute(
            "UPDATE job_queue SET \
               stdout_path = COALESCE(stdout_path, ?1), \
               stderr_path = COALESCE(stderr_path, ?2) \
             WHERE job_id = ?3",
            params![stdout_path, stderr_path, job_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Apply a terminal transition from `running`. Returns false when the
    /// row is no longer running (e.g. a cancel committed first).
    pub fn finish(
        &mut self,
        job_id: &str,
        state: JobState,
        return_code: Option<i32>,
        error_message: Option<&str>,
    ) -> Result<bool> {
        debug_assert!(state.is_terminal());
        let tx = self.write_tx()?;
        let changed = tx.execute(
            "UPDATE job_queue SET state = ?1, return_code = ?2, error_message = ?3, \
               end_time = ?4, worker_id = NULL, pid = NULL \
             WHERE job_id = ?5 AND state = ?6",
            params![
                state.as_str(),
                return_code,
                error_message,
                encode_time(Utc::now()),
                job_id,
                JobState::Running.as_str()
            ],
        )?;
        tx.commit()?;
        Ok(changed > 0)
    }

    pub fn cancel(&mut self, job_id: &str) -> Result<CancelOutcome> {
        let tx = self.write_tx()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT state FROM job_queue WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = current else {
            return Ok(CancelOutcome::NotFound);
        };
        let outcome = match raw.parse::<JobState>()? {
            JobState::Pending => {
                tx.execute(
                    "UPDATE job_queue SET state = ?1, end_time = ?2 WHERE job_id = ?3",
                    params![
                        JobState::Cancelled.as_str(),
                        encode_time(Utc::now()),
                        job_id
                    ],
                )?;
                CancelOutcome::Cancelled
            }
            JobState::Running => {
                // Leave end_time, worker_id and pid in place: the owning
                // worker observes the mark on its next supervision tick,
                // kills the process group, then confirms.
                tx.execute(
                    "UPDATE job_queue SET state = ?1 WHERE job_id = ?2",
                    params![JobState::Cancelled.as_str(), job_id],
                )?;
                CancelOutcome::MarkedRunning
            }
            _ => CancelOutcome::AlreadyTerminal,
        };
        tx.commit()?;
        Ok(outcome)
    }

    /// Stamp `end_time` on a cancel mark once the worker has reaped the
    /// child. Returns false when the row is not an unconfirmed cancel.
    pub fn confirm_cancel(&mut self, job_id: &str) -> Result<bool> {
        let tx = self.write_tx()?;
        let changed = tx.execute(
            "UPDATE job_queue SET end_time = ?1, worker_id = NULL, pid = NULL \
             WHERE job_id = ?2 AND state = ?3 AND end_time IS NULL",
            params![
                encode_time(Utc::now()),
                job_id,
                JobState::Cancelled.as_str()
            ],
        )?;
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Delete one job. Refuses non-terminal rows; returns false for unknown
    /// ids.
    pub fn delete(&mut self, job_id: &str) -> Result<bool> {
        let tx = self.write_tx()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT state FROM job_queue WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = current else {
            return Ok(false);
        };
        let state = raw.parse::<JobState>()?;
        if !state.is_terminal() {
            return Err(SchedError::IllegalTransition(format!(
                "cannot delete {state} job {job_id}"
            )));
        }
        tx.execute("DELETE FROM job_queue WHERE job_id = ?1", params![job_id])?;
        tx.commit()?;
        Ok(true)
    }

    /// Bulk-delete rows in the given terminal states, optionally only those
    /// that ended before `cutoff`. Returns the number removed.
    pub fn cleanup(
        &mut self,
        states: &[JobState],
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        if states.is_empty() {
            return Ok(0);
        }
        if let Some(state) = states.iter().find(|state| !state.is_terminal()) {
            return Err(SchedError::InvalidArgument(format!(
                "cleanup only accepts terminal states, got `{state}`"
            )));
        }

        let placeholders = vec!["?"; states.len()].join(", ");
        let mut sql = format!("DELETE FROM job_queue WHERE state IN ({placeholders})");
        let mut args: Vec<SqlValue> = states
            .iter()
            .map(|state| SqlValue::Text(state.as_str().to_string()))
            .collect();
        if let Some(cutoff) = cutoff {
            sql.push_str(" AND end_time IS NOT NULL AND end_time <= ?");
            args.push(SqlValue::Text(encode_time(cutoff)));
        }

        let tx = self.write_tx()?;
        let removed = tx.execute(&sql, params_from_iter(args))?;
        tx.commit()?;
        Ok(removed)
    }

    /// Resolve rows stranded by a dead pool: every `running` row becomes
    /// `failed` with `error_message`, and cancel marks left unconfirmed get
    /// their `end_time` stamped. Returns the number of rows failed.
    pub fn fail_orphans(&mut self, error_message: &str) -> Result<usize> {
        let now = encode_time(Utc::now());
        let tx = self.write_tx()?;
        let orphaned = tx.execute(
            "UPDATE job_queue SET state = ?1, return_code = -1, error_message = ?2, \
               end_time = ?3, worker_id = NULL, pid = NULL \
             WHERE state = ?4",
            params![
                JobState::Failed.as_str(),
                error_message,
                now,
                JobState::Running.as_str()
            ],
        )?;
        tx.execute(
            "UPDATE job_queue SET end_time = ?1, worker_id = NULL, pid = NULL \
             WHERE state = ?2 AND end_time IS NULL",
            params![now, JobState::Cancelled.as_str()],
        )?;
        tx.commit()?;
        Ok(orphaned)
    }

    fn write_tx(&mut self) -> Result<Transaction<'_>> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }
}

fn get_on(conn: &Connection, job_id: &str) -> Result<Option<Job>> {
    Ok(conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE job_id = ?1"),
            params![job_id],
            job_from_row,
        )
        .optional()?)
}

fn next_counter_tx(tx: &Transaction<'_>, name: &str) -> Result<i64> {
    tx.execute(
        "INSERT INTO counters(name, value) VALUES (?1, 1) \
         ON CONFLICT(name) DO UPDATE SET value = value + 1",
        params![name],
    )?;
    Ok(tx.query_row(
        "SELECT value FROM counters WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )?)
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let state = row
        .get::<_, String>(9)?
        .parse::<JobState>()
        .map_err(|err| invalid_column(9, err))?;
    let metadata = row
        .get::<_, Option<String>>(19)?
        .map(|raw| serde_json::from_str(&raw).map_err(|err| invalid_column(19, err)))
        .transpose()?;
    Ok(Job {
        job_id: row.get(0)?,
        job_name: row.get(1)?,
        command: row.get(2)?,
        working_dir: row.get(3)?,
        cpus: row.get(4)?,
        memory: row.get(5)?,
        timeout_seconds: row.get(6)?,
        priority: row.get(7)?,
        user: row.get(8)?,
        state,
        return_code: row.get(10)?,
        stdout_path: row.get(11)?,
        stderr_path: row.get(12)?,
        submit_time: time_column(row, 13)?,
        start_time: opt_time_column(row, 14)?,
        end_time: opt_time_column(row, 15)?,
        worker_id: row.get(16)?,
        pid: row.get::<_, Option<i64>>(17)?.map(|pid| pid as u32),
        error_message: row.get(18)?,
        metadata,
    })
}

fn encode_time(ts: DateTime<Utc>) -> String {
    // Fixed-width RFC 3339 in UTC: lexicographic order is chronological
    // order, which the claim index depends on.
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decode_time(raw: &str) -> chrono::ParseResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    decode_time(&raw).map_err(|err| invalid_column(idx, err))
}

fn opt_time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| decode_time(&raw).map_err(|err| invalid_column(idx, err)))
        .transpose()
}

fn invalid_column(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}
