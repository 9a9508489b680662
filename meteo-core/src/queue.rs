//! Durable background work queue.
//!
//! Jobs live in the `jobs` table and move `pending → running → done|failed`.
//! A worker that dies after claiming a job leaves it `running`; the next
//! worker start returns such stale jobs to `pending`, so delivery is
//! at-least-once and a job can run twice.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use std::{fmt::Debug, time::Duration};
use tracing::{debug, info};

use crate::{db::Database, error::QueueError, model::FetchJob};

/// Task name under which fetch jobs are enqueued.
pub const FETCH_TASK: &str = "weather.fetch";

/// Fire-and-forget side of the queue, used by request handlers.
#[async_trait]
pub trait JobQueue: Send + Sync + Debug {
    /// Enqueue a fetch and return its job id without waiting for it to run.
    async fn enqueue_fetch(&self, job: FetchJob) -> Result<i64, QueueError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

/// A job handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub id: i64,
    pub task_name: String,
    pub payload: String,
    pub attempts: i64,
}

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
}

/// SQLite-backed queue shared by the web process and the workers.
#[derive(Debug, Clone)]
pub struct SqliteJobQueue {
    db: Database,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl SqliteJobQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Enqueue an arbitrary task.
    pub async fn enqueue<T: Serialize>(&self, task_name: &str, args: &T) -> Result<i64, QueueError> {
        let task_name = task_name.to_string();
        let payload = serde_json::to_string(args)?;

        let id = self
            .db
            .call(move |conn| -> Result<i64, QueueError> {
                conn.execute(
                    "INSERT INTO jobs (task_name, payload, status, enqueued_at) \
                     VALUES (?1, ?2, 'pending', ?3)",
                    params![task_name, payload, now_rfc3339()],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        debug!(job_id = id, "job enqueued");
        Ok(id)
    }

    /// Atomically move the oldest pending job to `running`.
    pub async fn claim_next(&self) -> Result<Option<ClaimedJob>, QueueError> {
        self.db
            .call(|conn| -> Result<Option<ClaimedJob>, QueueError> {
                // Take the write lock up front so a second connection waits on
                // busy_timeout instead of failing the read-to-write upgrade.
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let job = tx
                    .query_row(
                        "SELECT id, task_name, payload, attempts FROM jobs \
                         WHERE status = 'pending' ORDER BY id LIMIT 1",
                        [],
                        |row| {
                            Ok(ClaimedJob {
                                id: row.get(0)?,
                                task_name: row.get(1)?,
                                payload: row.get(2)?,
                                attempts: row.get(3)?,
                            })
                        },
                    )
                    .optional()?;

                let Some(mut job) = job else {
                    return Ok(None);
                };

                let claimed = tx.execute(
                    "UPDATE jobs SET status = 'running', attempts = attempts + 1, claimed_at = ?2 \
                     WHERE id = ?1 AND status = 'pending'",
                    params![job.id, Utc::now().timestamp()],
                )?;
                tx.commit()?;
                if claimed == 0 {
                    return Ok(None);
                }

                job.attempts += 1;
                Ok(Some(job))
            })
            .await
    }

    pub async fn complete(&self, id: i64) -> Result<(), QueueError> {
        self.finish(id, JobStatus::Done, None).await
    }

    /// Record a failure. Failed jobs are not retried.
    pub async fn fail(&self, id: i64, error: &str) -> Result<(), QueueError> {
        self.finish(id, JobStatus::Failed, Some(error.to_string())).await
    }

    async fn finish(&self, id: i64, status: JobStatus, error: Option<String>) -> Result<(), QueueError> {
        self.db
            .call(move |conn| -> Result<(), QueueError> {
                conn.execute(
                    "UPDATE jobs SET status = ?2, finished_at = ?3, last_error = ?4 WHERE id = ?1",
                    params![id, status.as_str(), now_rfc3339(), error],
                )?;
                Ok(())
            })
            .await
    }

    /// Return jobs stuck in `running` for longer than `older_than` to `pending`.
    pub async fn requeue_stale(&self, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = Utc::now().timestamp() - i64::try_from(older_than.as_secs()).unwrap_or(i64::MAX);
        let requeued = self
            .db
            .call(move |conn| -> Result<usize, QueueError> {
                Ok(conn.execute(
                    "UPDATE jobs SET status = 'pending', claimed_at = NULL \
                     WHERE status = 'running' AND claimed_at <= ?1",
                    params![cutoff],
                )?)
            })
            .await?;

        if requeued > 0 {
            info!(requeued, "returned stale jobs to the queue");
        }
        Ok(requeued)
    }

    pub async fn status(&self, id: i64) -> Result<Option<JobStatus>, QueueError> {
        let raw: Option<String> = self
            .db
            .call(move |conn| -> Result<Option<String>, QueueError> {
                Ok(conn
                    .query_row("SELECT status FROM jobs WHERE id = ?1", params![id], |row| {
                        row.get(0)
                    })
                    .optional()?)
            })
            .await?;

        Ok(raw.and_then(|s| match s.as_str() {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }))
    }

    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        self.db
            .call(|conn| -> Result<QueueCounts, QueueError> {
                let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
                let mut rows = stmt.query([])?;
                let mut counts = QueueCounts::default();
                while let Some(row) = rows.next()? {
                    let status: String = row.get(0)?;
                    let n: i64 = row.get(1)?;
                    let n = u64::try_from(n).unwrap_or(0);
                    match status.as_str() {
                        "pending" => counts.pending = n,
                        "running" => counts.running = n,
                        "done" => counts.done = n,
                        "failed" => counts.failed = n,
                        _ => {}
                    }
                }
                Ok(counts)
            })
            .await
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue_fetch(&self, job: FetchJob) -> Result<i64, QueueError> {
        let id = self.enqueue(FETCH_TASK, &job).await?;
        info!(job_id = id, city = %job.city, lat = job.latitude, lon = job.longitude, "fetch scheduled");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> SqliteJobQueue {
        SqliteJobQueue::new(Database::open_in_memory().unwrap())
    }

    fn milan() -> FetchJob {
        FetchJob { city: "Milan".into(), latitude: 45.46, longitude: 9.19 }
    }

    #[tokio::test]
    async fn enqueue_then_claim_in_fifo_order() {
        let q = queue();
        let first = q.enqueue_fetch(milan()).await.unwrap();
        let second = q.enqueue_fetch(milan()).await.unwrap();

        let a = q.claim_next().await.unwrap().unwrap();
        let b = q.claim_next().await.unwrap().unwrap();

        assert_eq!((a.id, b.id), (first, second));
        assert_eq!(a.task_name, FETCH_TASK);
        assert_eq!(a.attempts, 1);
        assert_eq!(serde_json::from_str::<FetchJob>(&a.payload).unwrap(), milan());
        assert!(q.claim_next().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_across_connections_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let first = SqliteJobQueue::new(Database::open(&path).unwrap());
        let second = SqliteJobQueue::new(Database::open(&path).unwrap());

        let mut enqueued = Vec::new();
        for _ in 0..20 {
            enqueued.push(first.enqueue_fetch(milan()).await.unwrap());
        }

        async fn drain(q: SqliteJobQueue) -> Vec<i64> {
            let mut ids = Vec::new();
            while let Some(job) = q.claim_next().await.unwrap() {
                ids.push(job.id);
            }
            ids
        }

        let (a, b) = tokio::join!(tokio::spawn(drain(first.clone())), tokio::spawn(drain(second)));
        let mut claimed: Vec<i64> = a.unwrap().into_iter().chain(b.unwrap()).collect();
        claimed.sort_unstable();

        assert_eq!(claimed, enqueued);
        assert_eq!(first.counts().await.unwrap().running, 20);
    }

    #[tokio::test]
    async fn outcomes_are_recorded() {
        let q = queue();
        let ok = q.enqueue_fetch(milan()).await.unwrap();
        let bad = q.enqueue_fetch(milan()).await.unwrap();
        q.claim_next().await.unwrap();
        q.claim_next().await.unwrap();

        q.complete(ok).await.unwrap();
        q.fail(bad, "weather API responded with HTTP 404 Not Found").await.unwrap();

        assert_eq!(q.status(ok).await.unwrap(), Some(JobStatus::Done));
        assert_eq!(q.status(bad).await.unwrap(), Some(JobStatus::Failed));
        assert_eq!(q.status(999).await.unwrap(), None);
        assert_eq!(
            q.counts().await.unwrap(),
            QueueCounts { pending: 0, running: 0, done: 1, failed: 1 }
        );
    }

    #[tokio::test]
    async fn stale_running_jobs_are_redelivered() {
        let q = queue();
        let id = q.enqueue_fetch(milan()).await.unwrap();
        q.claim_next().await.unwrap().unwrap();

        assert_eq!(q.requeue_stale(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(q.requeue_stale(Duration::ZERO).await.unwrap(), 1);

        let again = q.claim_next().await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn finished_jobs_are_not_requeued() {
        let q = queue();
        let id = q.enqueue_fetch(milan()).await.unwrap();
        q.claim_next().await.unwrap();
        q.complete(id).await.unwrap();

        assert_eq!(q.requeue_stale(Duration::ZERO).await.unwrap(), 0);
        assert!(q.claim_next().await.unwrap().is_none());
    }
}
