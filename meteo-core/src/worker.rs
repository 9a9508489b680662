//! Background workers executing queued jobs.

use std::time::Duration;
use tokio::{sync::watch, task::JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    error::QueueError,
    model::FetchJob,
    pipeline::FetchPipeline,
    queue::{ClaimedJob, FETCH_TASK, SqliteJobQueue},
};

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    Failed(String),
}

/// Pulls jobs off the queue and runs them through the fetch pipeline.
#[derive(Debug, Clone)]
pub struct Worker {
    queue: SqliteJobQueue,
    pipeline: FetchPipeline,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(queue: SqliteJobQueue, pipeline: FetchPipeline, poll_interval: Duration) -> Self {
        Self { queue, pipeline, poll_interval }
    }

    async fn execute(&self, job: &ClaimedJob) -> JobOutcome {
        if job.task_name != FETCH_TASK {
            return JobOutcome::Failed(format!("unknown task '{}'", job.task_name));
        }

        let args: FetchJob = match serde_json::from_str(&job.payload) {
            Ok(args) => args,
            Err(e) => return JobOutcome::Failed(format!("bad payload: {e}")),
        };

        match self.pipeline.run(&args.city, args.latitude, args.longitude).await {
            Ok(_) => JobOutcome::Done,
            Err(e) => JobOutcome::Failed(e.to_string()),
        }
    }

    /// Claim and execute at most one job. `None` means the queue was empty.
    pub async fn run_once(&self) -> Result<Option<(i64, JobOutcome)>, QueueError> {
        let Some(job) = self.queue.claim_next().await? else {
            return Ok(None);
        };
        debug!(job_id = job.id, attempt = job.attempts, task = %job.task_name, "job claimed");

        let outcome = self.execute(&job).await;
        match &outcome {
            JobOutcome::Done => self.queue.complete(job.id).await?,
            JobOutcome::Failed(reason) => {
                warn!(job_id = job.id, %reason, "job failed");
                self.queue.fail(job.id, reason).await?;
            }
        }
        Ok(Some((job.id, outcome)))
    }

    /// Drain the queue until `shutdown` flips to `true`, sleeping between
    /// polls while it is empty.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            // A dropped sender counts as shutdown.
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }

            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!("queue error: {e}");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        debug!("worker stopped");
    }
}

/// Requeue stale jobs, then run `concurrency` workers until shutdown.
pub async fn run_pool(
    worker: Worker,
    concurrency: usize,
    stale_after: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<(), QueueError> {
    worker.queue.requeue_stale(stale_after).await?;

    info!(concurrency, "starting workers");
    let mut set = JoinSet::new();
    for _ in 0..concurrency.max(1) {
        set.spawn(worker.clone().run(shutdown.clone()));
    }
    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            error!("worker task panicked: {e}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::Database,
        provider::OpenMeteoProvider,
        queue::{JobQueue, JobStatus},
        store::{SampleStore, SqliteSampleStore},
    };
    use std::sync::Arc;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(server: &MockServer) -> (Worker, SqliteJobQueue, Arc<SqliteSampleStore>) {
        let db = Database::open_in_memory().unwrap();
        let store = Arc::new(SqliteSampleStore::new(db.clone()));
        let queue = SqliteJobQueue::new(db);
        let provider =
            Arc::new(OpenMeteoProvider::new(&server.uri(), Duration::from_secs(5)).unwrap());
        let pipeline = FetchPipeline::new(provider, store.clone());
        (Worker::new(queue.clone(), pipeline, Duration::from_millis(10)), queue, store)
    }

    fn milan_body() -> serde_json::Value {
        serde_json::json!({
            "latitude": 45.46,
            "longitude": 9.19,
            "current_weather": { "temperature": 8.0, "windspeed": 3.5, "time": "2025-12-03T12:00" }
        })
    }

    #[tokio::test]
    async fn run_once_executes_fetch_job() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("latitude", "45.46"))
            .respond_with(ResponseTemplate::new(200).set_body_json(milan_body()))
            .expect(1)
            .mount(&server)
            .await;
        let (worker, queue, store) = setup(&server).await;

        let id = queue
            .enqueue_fetch(FetchJob { city: "Milan".into(), latitude: 45.46, longitude: 9.19 })
            .await
            .unwrap();

        assert_eq!(worker.run_once().await.unwrap(), Some((id, JobOutcome::Done)));
        assert_eq!(queue.status(id).await.unwrap(), Some(JobStatus::Done));
        assert_eq!(store.latest().await.unwrap().unwrap().city, "Milan");
        assert_eq!(worker.run_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn upstream_failure_fails_job_without_sample() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let (worker, queue, store) = setup(&server).await;

        let id = queue
            .enqueue_fetch(FetchJob { city: "Milan".into(), latitude: 45.46, longitude: 9.19 })
            .await
            .unwrap();

        let (_, outcome) = worker.run_once().await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Failed(ref m) if m.contains("500")));
        assert_eq!(queue.status(id).await.unwrap(), Some(JobStatus::Failed));
        assert!(store.latest().await.unwrap().is_none());
        // no automatic retry
        assert_eq!(worker.run_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_task_is_failed() {
        let server = MockServer::start().await;
        let (worker, queue, _) = setup(&server).await;

        let id = queue.enqueue("weather.unknown", &serde_json::json!({})).await.unwrap();

        let (_, outcome) = worker.run_once().await.unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Failed("unknown task 'weather.unknown'".into()));
        assert_eq!(queue.status(id).await.unwrap(), Some(JobStatus::Failed));
    }

    #[tokio::test]
    async fn pool_drains_queue_and_stops_on_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(milan_body()))
            .mount(&server)
            .await;
        let (worker, queue, store) = setup(&server).await;

        for _ in 0..3 {
            queue
                .enqueue_fetch(FetchJob { city: "Milan".into(), latitude: 45.46, longitude: 9.19 })
                .await
                .unwrap();
        }

        let (tx, rx) = watch::channel(false);
        let pool = tokio::spawn(run_pool(worker, 2, Duration::from_secs(300), rx));

        for _ in 0..200 {
            if queue.counts().await.unwrap().done == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        pool.await.unwrap().unwrap();

        assert_eq!(queue.counts().await.unwrap().done, 3);
        assert_eq!(store.recent(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn dropped_sender_stops_idle_worker() {
        let server = MockServer::start().await;
        let (worker, queue, _) = setup(&server).await;
        let worker = Worker { poll_interval: Duration::from_secs(3600), ..worker };

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(tx);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker kept running after sender was dropped")
            .unwrap();

        let id = queue
            .enqueue_fetch(FetchJob { city: "Milan".into(), latitude: 45.46, longitude: 9.19 })
            .await
            .unwrap();
        assert_eq!(queue.status(id).await.unwrap(), Some(JobStatus::Pending));
    }

    #[tokio::test]
    async fn closed_channel_claims_nothing() {
        let server = MockServer::start().await;
        let (worker, queue, _) = setup(&server).await;
        let worker = Worker { poll_interval: Duration::from_secs(3600), ..worker };

        let id = queue
            .enqueue_fetch(FetchJob { city: "Milan".into(), latitude: 45.46, longitude: 9.19 })
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), worker.run(rx))
            .await
            .expect("worker kept running on a closed channel");

        assert_eq!(queue.status(id).await.unwrap(), Some(JobStatus::Pending));
    }
}
