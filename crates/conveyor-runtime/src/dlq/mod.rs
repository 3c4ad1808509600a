//! Permanent-failure sink with pluggable alerters.
//!
//! Distinct from a queue's own `<name>:dlq` list (§4.1's `MoveToDLQ`):
//! this sink wraps the job in a [`DlqEntry`] carrying failure context and
//! fans out to [`Alerter`]s, stored at `dlq:<name>`.

mod alerter;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use conveyor_core::job::Job;
use conveyor_core::store::Datastore;
use serde::{Deserialize, Serialize};
use tracing::{error, instrument, warn};

pub use alerter::{Alerter, CallbackAlerter, ChatAlerter, LogAlerter, WebhookAlerter};

use crate::queue::Queue;

const MAX_ENTRIES: isize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error(transparent)]
    Core(#[from] conveyor_core::error::Error),
    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),
}

pub type Result<T> = std::result::Result<T, DlqError>;

/// A job that exhausted its retry budget, plus the context needed to
/// inspect or retry it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub job: Job,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
    pub worker_id: String,
}

/// A permanent-failure sink for one named lane, stored at `dlq:<name>`.
pub struct DlqSink {
    datastore: Datastore,
    name: String,
    queue: Queue,
    alerters: Vec<Arc<dyn Alerter>>,
}

impl DlqSink {
    pub fn new(datastore: Datastore, name: impl Into<String>, queue: Queue) -> Self {
        Self {
            datastore,
            name: name.into(),
            queue,
            alerters: Vec::new(),
        }
    }

    pub fn with_alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerters.push(alerter);
        self
    }

    fn full_key(&self) -> String {
        self.datastore.key(&format!("dlq:{}", self.name))
    }

    /// Wrap `job` in a [`DlqEntry`], push it, trim to the newest 10 000
    /// entries, and fan the entry out to every registered alerter —
    /// non-blocking relative to each other; one failing alerter never
    /// prevents the others from firing.
    #[instrument(skip(self, job), fields(dlq = %self.name, job_id = %job.id()))]
    pub async fn add(&self, job: Job, error: impl Into<String>, worker_id: impl Into<String>) -> Result<()> {
        let attempts = job.attempts();
        let entry = DlqEntry {
            job,
            error: error.into(),
            failed_at: Utc::now(),
            attempts,
            worker_id: worker_id.into(),
        };

        let data = serde_json::to_string(&entry)
            .map_err(|e| conveyor_core::error::Error::deserialization(e.to_string()))?;

        self.datastore.lpush(&self.full_key(), &data).await?;
        self.datastore.ltrim(&self.full_key(), 0, MAX_ENTRIES - 1).await?;

        for alerter in &self.alerters {
            let alerter = Arc::clone(alerter);
            let entry_clone = entry.clone();
            tokio::spawn(async move {
                if let Err(e) = alerter.notify(&entry_clone).await {
                    warn!(alerter = alerter.name(), error = %e, "alerter failed");
                }
            });
        }

        Ok(())
    }

    /// List the entries currently parked, newest first.
    pub async fn list(&self) -> Result<Vec<DlqEntry>> {
        let raw = self.datastore.lrange(&self.full_key(), 0, -1).await?;
        Ok(raw
            .iter()
            .filter_map(|d| serde_json::from_str(d).ok())
            .collect())
    }

    /// Retry one entry: re-enqueue the original job with `attempts`
    /// reset to 0, and remove the exact entry by value so concurrent
    /// index shifts (another retry racing this one) don't drop the
    /// wrong entry.
    #[instrument(skip(self, entry), fields(dlq = %self.name, job_id = %entry.job.id()))]
    pub async fn retry(&self, entry: &DlqEntry) -> Result<()> {
        let mut job = entry.job.clone();
        job.reset_attempts();

        let data = serde_json::to_string(entry)
            .map_err(|e| conveyor_core::error::Error::deserialization(e.to_string()))?;

        self.queue.enqueue(&job).await?;
        self.datastore.lrem_all(&self.full_key(), &data).await?;
        Ok(())
    }

    /// Drain the DLQ one-by-one, retrying each entry. If an enqueue
    /// mid-drain fails, the entry stays parked and the operation returns
    /// the partial count retried so far.
    #[instrument(skip(self), fields(dlq = %self.name))]
    pub async fn retry_all(&self) -> Result<u64> {
        let entries = self.list().await?;
        let mut retried = 0u64;

        for entry in entries {
            match self.retry(&entry).await {
                Ok(()) => retried += 1,
                Err(e) => {
                    error!(dlq = %self.name, retried, error = %e, "retry_all stopped early");
                    return Ok(retried);
                }
            }
        }

        Ok(retried)
    }

    pub async fn len(&self) -> Result<u64> {
        Ok(self.datastore.llen(&self.full_key()).await? as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dlq_key_naming() {
        let name = "orders";
        assert_eq!(format!("dlq:{name}"), "dlq:orders");
    }
}
