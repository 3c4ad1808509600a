//! Dependency manager: successor jobs held back until a predecessor
//! completes.
//!
//! Each predecessor `P` owns a list at `deps:P` holding the serialized
//! successor jobs that must be unblocked when `P` completes.

use conveyor_core::job::{Job, JobId};
use conveyor_core::store::Datastore;
use tracing::{instrument, warn};

use crate::queue::Queue;

#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error(transparent)]
    Core(#[from] conveyor_core::error::Error),
    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),
}

pub type Result<T> = std::result::Result<T, DependencyError>;

/// Manages `deps:<predecessorID>` lists against a datastore and enqueues
/// unblocked successors onto a target queue.
#[derive(Clone)]
pub struct DependencyManager {
    datastore: Datastore,
    queue: Queue,
}

impl DependencyManager {
    pub fn new(datastore: Datastore, queue: Queue) -> Self {
        Self { datastore, queue }
    }

    fn deps_key(&self, predecessor: &JobId) -> String {
        self.datastore.key(&format!("deps:{predecessor}"))
    }

    /// Register `successor` as dependent on `predecessor` completing.
    #[instrument(skip(self, successor), fields(predecessor = %predecessor, successor = %successor.id()))]
    pub async fn add_with_dependency(&self, successor: &Job, predecessor: &JobId) -> Result<()> {
        let data = successor
            .to_json()
            .map_err(|e| conveyor_core::error::Error::deserialization(e.to_string()))?;
        self.datastore
            .lpush(&self.deps_key(predecessor), &data)
            .await?;
        Ok(())
    }

    /// Unblock every successor registered against `predecessor`: pop each
    /// one and enqueue it on the target queue. On enqueue failure the
    /// entry is pushed back and the operation aborts with an error,
    /// leaving the remaining (unprocessed) successors still queued.
    #[instrument(skip(self), fields(predecessor = %predecessor))]
    pub async fn complete(&self, predecessor: &JobId) -> Result<u64> {
        let key = self.deps_key(predecessor);
        let mut unblocked = 0u64;

        loop {
            let popped = self.datastore.rpop(&key).await?;
            let Some(data) = popped else {
                break;
            };

            let job = match Job::from_json(&data) {
                Ok(job) => job,
                Err(_) => {
                    warn!(predecessor = %predecessor, "corrupt successor payload, dropping");
                    continue;
                }
            };

            if let Err(e) = self.queue.enqueue(&job).await {
                // Push the entry back so it isn't lost, then surface the
                // failure — the caller decides whether to retry Complete.
                self.datastore.lpush(&key, &data).await?;
                return Err(e.into());
            }

            unblocked += 1;
        }

        Ok(unblocked)
    }

    /// Read (without consuming) the successors currently pending on
    /// `predecessor`.
    pub async fn pending_dependents(&self, predecessor: &JobId) -> Result<Vec<Job>> {
        let entries = self
            .datastore
            .lrange(&self.deps_key(predecessor), 0, -1)
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(|data| Job::from_json(&data).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deps_key_naming() {
        let id = JobId::from_string("abc123");
        assert_eq!(format!("deps:{id}"), "deps:abc123");
    }
}
