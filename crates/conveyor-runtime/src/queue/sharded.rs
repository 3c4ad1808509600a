//! Sharded queue router: spreads jobs across N underlying [`Queue`]s.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use conveyor_core::job::Job;
use conveyor_core::store::Datastore;
use sha2::{Digest, Sha256};
use tracing::instrument;

use super::{JobSource, Queue, QueueError, Result};
use crate::events::EventStream;

/// How a job is assigned to one of a sharded queue's N underlying queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStrategy {
    /// First 8 bytes of SHA-256 of the job ID, modulo shard count.
    ConsistentHash,
    /// A shared counter incremented on every enqueue, modulo shard count.
    RoundRobin,
    /// The shard with the smallest current length.
    LeastLoaded,
}

/// A queue split across N shards, each a full [`Queue`] under its own
/// suffixed name (`<name>:0`, `<name>:1`, ...).
pub struct ShardedQueue {
    shards: Vec<Queue>,
    strategy: ShardStrategy,
    round_robin_counter: AtomicUsize,
}

impl ShardedQueue {
    pub fn new(
        datastore: Datastore,
        name: impl Into<String>,
        shard_count: usize,
        strategy: ShardStrategy,
    ) -> Result<Self> {
        let name = name.into();
        if shard_count == 0 {
            return Err(QueueError::Core(conveyor_core::error::Error::validation(
                "shard count must be at least 1",
            )));
        }

        let shards = (0..shard_count)
            .map(|i| Queue::new(datastore.clone(), format!("{name}:{i}")))
            .collect();

        Ok(Self {
            shards,
            strategy,
            round_robin_counter: AtomicUsize::new(0),
        })
    }

    /// Attach an event stream to every shard so enqueues across the
    /// whole sharded queue append `Queued` events.
    pub fn with_events(mut self, events: EventStream) -> Self {
        self.shards = self
            .shards
            .into_iter()
            .map(|shard| shard.with_events(events.clone()))
            .collect();
        self
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Which shard a job by this ID would be assigned to under
    /// consistent-hash. Exposed so `PartitionedWorker` and tests can
    /// reason about placement independent of the enqueue call.
    pub fn consistent_hash_shard(&self, job_id: &str) -> usize {
        let digest = Sha256::digest(job_id.as_bytes());
        let mut first8 = [0u8; 8];
        first8.copy_from_slice(&digest[0..8]);
        let hashed = u64::from_be_bytes(first8);
        (hashed % self.shards.len() as u64) as usize
    }

    #[instrument(skip(self, job), fields(job_id = %job.id(), strategy = ?self.strategy))]
    pub async fn enqueue(&self, job: &Job) -> Result<()> {
        let shard_index = match self.strategy {
            ShardStrategy::ConsistentHash => self.consistent_hash_shard(job.id().as_str()),
            ShardStrategy::RoundRobin => {
                let n = self.round_robin_counter.fetch_add(1, Ordering::Relaxed);
                n % self.shards.len()
            }
            ShardStrategy::LeastLoaded => self.least_loaded_shard().await?,
        };

        self.shards[shard_index].enqueue(job).await
    }

    async fn least_loaded_shard(&self) -> Result<usize> {
        let mut best_index = 0;
        let mut best_len = u64::MAX;
        for (i, shard) in self.shards.iter().enumerate() {
            let len = shard.len().await?;
            if len < best_len {
                best_len = len;
                best_index = i;
            }
        }
        Ok(best_index)
    }

    /// Poll every shard in order, giving each `timeout / shard_count`.
    /// Returns the first non-nil job.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>> {
        let per_shard_timeout = timeout / (self.shards.len() as u32).max(1);
        for shard in &self.shards {
            if let Some(job) = shard.dequeue(per_shard_timeout).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    pub async fn len(&self) -> Result<u64> {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.len().await?;
        }
        Ok(total)
    }

    pub async fn len_per_shard(&self) -> Result<Vec<u64>> {
        let mut lengths = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            lengths.push(shard.len().await?);
        }
        Ok(lengths)
    }

    /// Borrow a specific shard directly, e.g. to build a
    /// [`PartitionedWorker`] pinned to it.
    pub fn shard(&self, index: usize) -> Option<&Queue> {
        self.shards.get(index)
    }
}

/// A worker pinned to one shard of a [`ShardedQueue`], giving a process
/// ownership of a fixed subset of throughput instead of competing with
/// other workers across every shard.
pub struct PartitionedWorker<'a> {
    queue: &'a Queue,
}

impl<'a> PartitionedWorker<'a> {
    pub fn new(sharded: &'a ShardedQueue, shard_index: usize) -> Result<Self> {
        let queue = sharded.shard(shard_index).ok_or_else(|| {
            QueueError::Core(conveyor_core::error::Error::validation(format!(
                "unknown shard index {shard_index}"
            )))
        })?;
        Ok(Self { queue })
    }

    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>> {
        self.queue.dequeue(timeout).await
    }
}

#[async_trait]
impl JobSource for ShardedQueue {
    async fn dequeue(&self, timeout: Duration) -> anyhow::Result<Option<Job>> {
        Ok(ShardedQueue::dequeue(self, timeout).await?)
    }

    async fn enqueue(&self, job: &Job) -> anyhow::Result<()> {
        Ok(ShardedQueue::enqueue(self, job).await?)
    }

    /// Re-enqueue a failed job on the same shard it would be assigned to
    /// today, without appending a duplicate `Queued` event (mirrors
    /// [`Queue`]'s override for the same spec §8 scenario 2 reason).
    async fn requeue(&self, job: &Job) -> anyhow::Result<()> {
        let shard_index = match self.strategy {
            ShardStrategy::ConsistentHash => self.consistent_hash_shard(job.id().as_str()),
            ShardStrategy::RoundRobin => {
                let n = self.round_robin_counter.fetch_add(1, Ordering::Relaxed);
                n % self.shards.len()
            }
            ShardStrategy::LeastLoaded => self.least_loaded_shard().await?,
        };

        Ok(self.shards[shard_index].push_without_event(job).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consistent_hash_is_deterministic_and_in_range() {
        // Build without a live connection: Datastore::connect isn't
        // needed for key derivation, so construct shards directly isn't
        // possible without a connection; instead verify the hash math
        // independent of ShardedQueue via the same algorithm.
        let shard_count = 4u64;
        let digest = Sha256::digest(b"job-123");
        let mut first8 = [0u8; 8];
        first8.copy_from_slice(&digest[0..8]);
        let hashed = u64::from_be_bytes(first8);
        let shard_a = hashed % shard_count;

        let digest2 = Sha256::digest(b"job-123");
        let mut first8b = [0u8; 8];
        first8b.copy_from_slice(&digest2[0..8]);
        let hashed2 = u64::from_be_bytes(first8b);
        let shard_b = hashed2 % shard_count;

        assert_eq!(shard_a, shard_b);
        assert!(shard_a < shard_count);
    }
}
