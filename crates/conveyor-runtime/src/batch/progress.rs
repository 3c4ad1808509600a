//! Per-job progress reporting: a `progress:<jobID>` hash a long-running
//! handler updates as it works, so a caller can poll completion percentage
//! without waiting on the job's terminal event.

use conveyor_core::job::JobId;
use conveyor_core::store::Datastore;
use tracing::instrument;

use super::BatchError;

pub type Result<T> = std::result::Result<T, BatchError>;

/// A point-in-time read of one job's progress hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
    pub message: Option<String>,
}

impl Progress {
    /// `current / total` as a percentage, `0` when `total` is `0`.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.current as f64 / self.total as f64) * 100.0
        }
    }
}

/// Reads and writes the `progress:<jobID>` hash.
#[derive(Clone)]
pub struct ProgressTracker {
    datastore: Datastore,
}

impl ProgressTracker {
    pub fn new(datastore: Datastore) -> Self {
        Self { datastore }
    }

    fn key(&self, job_id: &JobId) -> String {
        self.datastore.key(&format!("progress:{job_id}"))
    }

    /// Set `total` and reset `current` to `0`, e.g. at the start of a
    /// long-running handler.
    #[instrument(skip(self), fields(job_id = %job_id, total))]
    pub async fn start(&self, job_id: &JobId, total: u64) -> Result<()> {
        self.datastore.hset(&self.key(job_id), "current", "0").await?;
        self.datastore
            .hset(&self.key(job_id), "total", &total.to_string())
            .await?;
        Ok(())
    }

    /// Advance `current` by `delta`, returning the new value.
    #[instrument(skip(self), fields(job_id = %job_id, delta))]
    pub async fn advance(&self, job_id: &JobId, delta: u64) -> Result<i64> {
        let value = self.datastore.hincrby(&self.key(job_id), "current", delta as i64).await?;
        Ok(value)
    }

    pub async fn set_message(&self, job_id: &JobId, message: impl Into<String>) -> Result<()> {
        self.datastore
            .hset(&self.key(job_id), "message", &message.into())
            .await?;
        Ok(())
    }

    /// Read back the current progress snapshot. Missing fields default to
    /// `0`/`None` rather than erroring, since a handler may not have
    /// called [`Self::start`] yet.
    pub async fn get(&self, job_id: &JobId) -> Result<Progress> {
        let fields = self.datastore.hgetall(&self.key(job_id)).await?;
        Ok(Progress {
            current: fields.get("current").and_then(|v| v.parse().ok()).unwrap_or(0),
            total: fields.get("total").and_then(|v| v.parse().ok()).unwrap_or(0),
            message: fields.get("message").cloned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_with_zero_total_is_zero() {
        let progress = Progress {
            current: 5,
            total: 0,
            message: None,
        };
        assert_eq!(progress.percent(), 0.0);
    }

    #[test]
    fn test_percent_computation() {
        let progress = Progress {
            current: 25,
            total: 200,
            message: None,
        };
        assert_eq!(progress.percent(), 12.5);
    }
}
