//! Cron-driven enqueueing of recurring fetches.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::{str::FromStr, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    config::ScheduleConfig,
    model::FetchJob,
    queue::JobQueue,
};

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expr}': {reason}")]
    CronParse { expr: String, reason: String },
}

/// Parse a cron expression.
///
/// The `cron` crate wants a leading seconds field; plain 5-field expressions
/// get `0` prepended.
pub fn parse_cron(expr: &str) -> Result<Schedule, ScheduleError> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };

    Schedule::from_str(&normalized).map_err(|e| ScheduleError::CronParse {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Debug)]
struct Entry {
    config: ScheduleConfig,
    schedule: Schedule,
    next_run: Option<DateTime<Utc>>,
}

/// Enqueues a fetch job for every schedule entry whose time has come.
#[derive(Debug)]
pub struct Scheduler {
    queue: Arc<dyn JobQueue>,
    entries: Vec<Entry>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        configs: &[ScheduleConfig],
        now: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        let entries = configs
            .iter()
            .map(|config| {
                let schedule = parse_cron(&config.cron)?;
                let next_run = schedule.after(&now).next();
                Ok(Entry { config: config.clone(), schedule, next_run })
            })
            .collect::<Result<Vec<_>, ScheduleError>>()?;

        Ok(Self { queue, entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Next planned run of the named entry.
    pub fn next_run(&self, name: &str) -> Option<DateTime<Utc>> {
        self.entries.iter().find(|e| e.config.name == name).and_then(|e| e.next_run)
    }

    /// Enqueue every entry due at `now` and advance it. Returns how many jobs
    /// were enqueued.
    ///
    /// A run missed by several periods is enqueued once, not once per period.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> usize {
        let mut enqueued = 0;
        for entry in &mut self.entries {
            let Some(due) = entry.next_run else { continue };
            if due > now {
                continue;
            }

            let job = FetchJob {
                city: entry.config.city.clone(),
                latitude: entry.config.latitude,
                longitude: entry.config.longitude,
            };
            match self.queue.enqueue_fetch(job).await {
                Ok(job_id) => {
                    debug!(schedule = %entry.config.name, job_id, "scheduled fetch enqueued");
                    enqueued += 1;
                }
                Err(e) => warn!(schedule = %entry.config.name, "failed to enqueue: {e}"),
            }
            entry.next_run = entry.schedule.after(&now).next();
        }
        enqueued
    }

    /// Tick every `every` until `shutdown` flips to `true`.
    pub async fn run(mut self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(entries = self.entries.len(), "scheduler started");
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
        debug!("scheduler stopped");
    }
}
