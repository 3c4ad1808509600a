//! Distributed lock with a fencing token.
//!
//! Acquire is `SET key fencingToken NX PX ttl`. Release and extend run a
//! server-side compare-and-swap script keyed on the token, so only the
//! holder that acquired the lock can release or extend it.

use std::time::Duration;

use conveyor_core::store::{Datastore, SetNxOutcome};
use rand::Rng;
use tracing::{debug, instrument};

use super::{ConcurrencyError, Result};

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// A held lock: the key it guards and the fencing token that proves
/// ownership. Dropping this value does not release the lock — call
/// [`Lock::release`] or use [`Lock::with_lock`] for scoped acquisition.
#[derive(Debug, Clone)]
pub struct Held {
    pub key: String,
    pub fencing_token: String,
}

/// A named distributed lock, stored at `lock:<key>`.
#[derive(Clone)]
pub struct Lock {
    datastore: Datastore,
    key: String,
}

impl Lock {
    pub fn new(datastore: Datastore, key: impl Into<String>) -> Self {
        Self {
            datastore,
            key: key.into(),
        }
    }

    fn full_key(&self) -> String {
        self.datastore.key(&format!("lock:{}", self.key))
    }

    /// Attempt to acquire the lock once. Returns `Ok(None)` (not an
    /// error) if someone else already holds it.
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn try_acquire_once(&self, ttl: Duration) -> Result<Option<Held>> {
        let token = new_fencing_token();
        let outcome = self
            .datastore
            .set_nx_px(&self.full_key(), &token, ttl)
            .await
            .map_err(conveyor_core::error::Error::from)?;

        match outcome {
            SetNxOutcome::Set => Ok(Some(Held {
                key: self.key.clone(),
                fencing_token: token,
            })),
            SetNxOutcome::AlreadyExists => Ok(None),
        }
    }

    /// Retry acquisition with exponential backoff (10 ms doubling, capped
    /// at 1 s) until `max_wait` elapses.
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn try_acquire(&self, ttl: Duration, max_wait: Duration) -> Result<Held> {
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut backoff = Duration::from_millis(10);

        loop {
            if let Some(held) = self.try_acquire_once(ttl).await? {
                return Ok(held);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ConcurrencyError::LockNotAcquired(self.key.clone()));
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            tokio::time::sleep(backoff.min(remaining)).await;
            backoff = (backoff * 2).min(Duration::from_secs(1));
        }
    }

    /// Release the lock. A no-op (not an error) if `held` no longer owns
    /// the key — the compare-and-swap script only deletes on a matching
    /// token.
    #[instrument(skip(self, held), fields(key = %self.key))]
    pub async fn release(&self, held: &Held) -> Result<()> {
        let deleted = self
            .datastore
            .eval_script(RELEASE_SCRIPT, &[&self.full_key()], &[&held.fencing_token])
            .await
            .map_err(conveyor_core::error::Error::from)?;
        debug!(key = %self.key, deleted, "release attempt");
        Ok(())
    }

    /// Extend the TTL of a held lock. Returns whether the extend
    /// succeeded (false if the token no longer matches).
    pub async fn extend(&self, held: &Held, ttl: Duration) -> Result<bool> {
        let result = self
            .datastore
            .eval_script(
                EXTEND_SCRIPT,
                &[&self.full_key()],
                &[&held.fencing_token, &ttl.as_millis().to_string()],
            )
            .await
            .map_err(conveyor_core::error::Error::from)?;
        Ok(result == 1)
    }

    /// Scoped acquisition: runs `f` while holding the lock. On normal
    /// return the lock is released inline before this call returns. If
    /// `f` panics, [`LockGuard`]'s `Drop` fires during unwind and spawns
    /// a detached release; that release racing the process exit is why
    /// the lock still carries a TTL as a backstop rather than relying on
    /// the guard alone.
    pub async fn with_lock<F, Fut, T>(&self, ttl: Duration, max_wait: Duration, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let held = self.try_acquire(ttl, max_wait).await?;
        let guard = LockGuard {
            lock: self.clone(),
            held: Some(held),
        };
        let result = f().await;
        guard.release().await?;
        Ok(result)
    }
}

/// RAII handle returned while a lock is held inside [`Lock::with_lock`].
/// Dropping it without calling [`Self::release`] first (e.g. because the
/// scoped closure panicked) spawns a detached task that releases the
/// lock in the background, best-effort.
struct LockGuard {
    lock: Lock,
    held: Option<Held>,
}

impl LockGuard {
    async fn release(mut self) -> Result<()> {
        match self.held.take() {
            Some(held) => self.lock.release(&held).await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(held) = self.held.take() {
            let lock = self.lock.clone();
            tokio::spawn(async move {
                let _ = lock.release(&held).await;
            });
        }
    }
}

fn new_fencing_token() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fencing_token_is_32_hex_chars() {
        let token = new_fencing_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fencing_tokens_are_unique() {
        assert_ne!(new_fencing_token(), new_fencing_token());
    }
}
