use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the default database location.
pub const DB_PATH_ENV: &str = "SCHEDARRAY_DB";

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Number of worker slots in the pool.
    pub max_workers: usize,
    /// How long an idle worker sleeps between claim attempts.
    pub poll_interval: Duration,
    /// How long a graceful stop waits for in-flight jobs.
    pub drain_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_workers: default_max_workers(),
            poll_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Default::default()
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Directory that receives per-job stdout/stderr files.
    pub fn log_dir(&self) -> PathBuf {
        self.db_dir().join("logs")
    }

    /// Pid file guarding the single service instance.
    pub fn pid_path(&self) -> PathBuf {
        self.db_dir().join("schedarray.pid")
    }

    fn db_dir(&self) -> PathBuf {
        self.db_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Resolve the database path: explicit flag, then `SCHEDARRAY_DB`, then
/// `$HOME/.schedarray/db`.
pub fn resolve_db_path(flag: Option<PathBuf>) -> PathBuf {
    if let Some(path) = flag {
        return path;
    }
    if let Ok(path) = env::var(DB_PATH_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    default_db_path()
}

fn default_db_path() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".schedarray")
        .join("db")
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
