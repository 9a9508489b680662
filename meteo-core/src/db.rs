//! Shared SQLite handle for the sample store and the job queue.

use rusqlite::Connection;
use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::error::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS weather_samples (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    city            TEXT    NOT NULL,
    latitude        REAL    NOT NULL,
    longitude       REAL    NOT NULL,
    temperature_c   REAL    NOT NULL,
    windspeed_kmh   REAL    NOT NULL,
    observed_at     TEXT    NOT NULL,
    observed_at_us  INTEGER NOT NULL,
    created_at      TEXT    NOT NULL,
    created_at_us   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_samples_observed ON weather_samples(observed_at_us DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_samples_created ON weather_samples(created_at_us);

CREATE TABLE IF NOT EXISTS jobs (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    task_name    TEXT    NOT NULL,
    payload      TEXT    NOT NULL,
    status       TEXT    NOT NULL DEFAULT 'pending',
    attempts     INTEGER NOT NULL DEFAULT 0,
    enqueued_at  TEXT    NOT NULL,
    claimed_at   INTEGER,
    finished_at  TEXT,
    last_error   TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, id);
";

/// A single SQLite connection behind a mutex.
///
/// The lock is only taken inside `spawn_blocking`, never across an `.await`.
#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        // Server and worker processes share the file.
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// Private in-memory database, used by tests and one-off commands.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Run `f` against the connection on the blocking pool.
    pub async fn call<T, E, F>(&self, f: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, E> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| E::from(StoreError::Poisoned))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| E::from(StoreError::Join(e)))?
    }
}
