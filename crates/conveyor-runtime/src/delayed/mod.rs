//! Delayed-delivery scheduler: a sorted set of jobs scored by UNIX-seconds
//! due-time, drained by a 1-second ticker.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use conveyor_core::job::Job;
use conveyor_core::store::Datastore;
use tokio::sync::watch;
use tracing::{debug, error, instrument};

use crate::queue::Queue;

#[derive(Debug, thiserror::Error)]
pub enum DelayedError {
    #[error(transparent)]
    Core(#[from] conveyor_core::error::Error),
    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),
}

pub type Result<T> = std::result::Result<T, DelayedError>;

/// Schedules jobs for future delivery into an underlying [`Queue`].
pub struct DelayedScheduler {
    datastore: Datastore,
    name: String,
    queue: Queue,
    shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl DelayedScheduler {
    pub fn new(datastore: Datastore, name: impl Into<String>, queue: Queue) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            datastore,
            name: name.into(),
            queue,
            shutdown_rx,
            shutdown_tx,
        }
    }

    fn scheduled_key(&self) -> String {
        self.datastore.key(&format!("{}:scheduled", self.name))
    }

    /// Schedule `job` for delivery at `at`.
    #[instrument(skip(self, job), fields(queue = %self.name, job_id = %job.id()))]
    pub async fn schedule_at(&self, job: &Job, at: DateTime<Utc>) -> Result<()> {
        let data = job
            .to_json()
            .map_err(|e| conveyor_core::error::Error::deserialization(e.to_string()))?;
        self.datastore
            .zadd(&self.scheduled_key(), &data, at.timestamp() as f64)
            .await?;
        Ok(())
    }

    /// `ScheduleAfter(d)` = `ScheduleAt(now + d)`.
    pub async fn schedule_after(&self, job: &Job, delay: Duration) -> Result<()> {
        let at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        self.schedule_at(job, at).await
    }

    /// Run one pass: move every job whose due-time has elapsed into the
    /// target queue. If an enqueue fails the member is left in place (the
    /// ZREM is skipped) and is retried on the next tick.
    #[instrument(skip(self), fields(queue = %self.name))]
    pub async fn tick(&self) -> Result<u64> {
        let now = now_unix_secs();
        let due = self
            .datastore
            .zrangebyscore(&self.scheduled_key(), f64::NEG_INFINITY, now)
            .await?;

        let mut moved = 0u64;
        for data in due {
            let job = match Job::from_json(&data) {
                Ok(job) => job,
                Err(_) => {
                    // Corrupt entry: drop it rather than retry forever.
                    self.datastore.zrem(&self.scheduled_key(), &data).await?;
                    continue;
                }
            };

            match self.queue.enqueue(&job).await {
                Ok(()) => {
                    self.datastore.zrem(&self.scheduled_key(), &data).await?;
                    moved += 1;
                }
                Err(e) => {
                    error!(queue = %self.name, error = %e, "enqueue of due job failed, retrying next tick");
                }
            }
        }

        Ok(moved)
    }

    /// Run [`Self::tick`] every second until [`Self::shutdown`] is called.
    pub fn spawn(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            let mut shutdown_rx = self.shutdown_rx.clone();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick().await {
                            error!(queue = %self.name, error = %e, "delayed scheduler tick failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!(queue = %self.name, "delayed scheduler shutting down");
                        break;
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn now_unix_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_scheduled_key_naming() {
        let name = "orders";
        assert_eq!(format!("{name}:scheduled"), "orders:scheduled");
    }
}
