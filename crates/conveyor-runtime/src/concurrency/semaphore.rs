//! Distributed counting semaphore: a sorted set where each held slot is a
//! member scored by its own expiry.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use conveyor_core::store::Datastore;
use rand::Rng;
use tracing::instrument;

use super::Result;

/// A held semaphore slot. Release it with [`DistributedSemaphore::release`].
#[derive(Debug, Clone)]
pub struct Permit {
    pub slot_id: String,
}

/// A named distributed semaphore, stored at `sem:<key>`.
#[derive(Clone)]
pub struct DistributedSemaphore {
    datastore: Datastore,
    key: String,
    limit: u64,
}

impl DistributedSemaphore {
    pub fn new(datastore: Datastore, key: impl Into<String>, limit: u64) -> Self {
        Self {
            datastore,
            key: key.into(),
            limit,
        }
    }

    fn full_key(&self) -> String {
        self.datastore.key(&format!("sem:{}", self.key))
    }

    /// Evict expired holders, then acquire a slot if the cardinality is
    /// still under the limit. Returns `Ok(None)` (not an error) if the
    /// semaphore is full.
    #[instrument(skip(self), fields(key = %self.key, limit = self.limit))]
    pub async fn acquire(&self, ttl: Duration) -> Result<Option<Permit>> {
        let now = now_secs();
        self.datastore
            .zremrangebyscore(&self.full_key(), f64::NEG_INFINITY, now)
            .await
            .map_err(conveyor_core::error::Error::from)?;

        let current = self
            .datastore
            .zcard(&self.full_key())
            .await
            .map_err(conveyor_core::error::Error::from)? as u64;

        if current >= self.limit {
            return Ok(None);
        }

        let slot_id = new_slot_id();
        let expiry = now + ttl.as_secs_f64();
        self.datastore
            .zadd(&self.full_key(), &slot_id, expiry)
            .await
            .map_err(conveyor_core::error::Error::from)?;

        Ok(Some(Permit { slot_id }))
    }

    pub async fn release(&self, permit: &Permit) -> Result<()> {
        self.datastore
            .zrem(&self.full_key(), &permit.slot_id)
            .await
            .map_err(conveyor_core::error::Error::from)?;
        Ok(())
    }

    /// Remaining capacity, clamped at zero.
    pub async fn available(&self) -> Result<u64> {
        let now = now_secs();
        self.datastore
            .zremrangebyscore(&self.full_key(), f64::NEG_INFINITY, now)
            .await
            .map_err(conveyor_core::error::Error::from)?;
        let current = self
            .datastore
            .zcard(&self.full_key())
            .await
            .map_err(conveyor_core::error::Error::from)? as u64;
        Ok(self.limit.saturating_sub(current))
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn new_slot_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_ids_are_unique() {
        assert_ne!(new_slot_id(), new_slot_id());
    }
}
