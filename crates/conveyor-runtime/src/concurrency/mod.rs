//! Concurrency primitives: distributed mutex, counting semaphore, and
//! sliding-window rate limiter. The dependency graph lives in
//! [`crate::deps`] since it models job-to-job ordering rather than a
//! generic resource constraint.

mod lock;
mod rate_limiter;
mod semaphore;

pub use lock::{Held, Lock};
pub use rate_limiter::RateLimiter;
pub use semaphore::{DistributedSemaphore, Permit};

/// Errors raised by the concurrency primitives.
#[derive(Debug, thiserror::Error)]
pub enum ConcurrencyError {
    #[error(transparent)]
    Core(#[from] conveyor_core::error::Error),

    /// A lock could not be acquired within its `max_wait` budget. A
    /// distinct, non-fatal signal — not every failed acquisition is a
    /// transport problem.
    #[error("lock not acquired for key: {0}")]
    LockNotAcquired(String),
}

pub type Result<T> = std::result::Result<T, ConcurrencyError>;
