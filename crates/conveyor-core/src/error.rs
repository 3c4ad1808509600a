//! Error taxonomy shared by every datastore-backed operation in the workspace.
//!
//! Kinds mirror the failure classes a caller actually needs to branch on
//! (see spec §7): transport failures are retryable by the caller,
//! not-found is a distinct 404-equivalent, lock-not-acquired is a
//! non-fatal signal from the lock/semaphore subsystems, deserialization
//! errors are either routed to a DLQ (job payloads) or returned directly
//! (workflow state), timeouts are context-bound, and validation errors
//! fail fast before anything is persisted.

use thiserror::Error;

/// Result type alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by datastore-backed operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The datastore connection was unreachable or the call timed out at
    /// the transport layer. Callers retry with their own policy.
    #[error("datastore transport error: {0}")]
    Transport(String),

    /// A key was absent where one was expected (missing workflow state on
    /// resume, missing job on retry).
    #[error("not found: {0}")]
    NotFound(String),

    /// A lock or semaphore slot could not be acquired. Not a failure in
    /// itself — callers are expected to treat this as contention.
    #[error("lock not acquired: {0}")]
    LockNotAcquired(String),

    /// A stored payload failed to deserialize.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// An operation did not complete within its bound.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A caller-supplied value was invalid (bad cron expression, empty
    /// handler name, out-of-range shard index). Fails fast, before any
    /// enqueue or persistence happens.
    #[error("validation error: {0}")]
    Validation(String),
}

impl Error {
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn lock_not_acquired(msg: impl Into<String>) -> Self {
        Error::LockNotAcquired(msg.into())
    }

    pub fn deserialization(msg: impl Into<String>) -> Self {
        Error::Deserialization(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Whether this error class is one a caller should retry without
    /// changing anything about the request.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            Error::Transport(err.to_string())
        } else {
            Error::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Deserialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_transport() {
        assert!(Error::transport("boom").is_transport());
        assert!(!Error::not_found("x").is_transport());
    }

    #[test]
    fn test_display() {
        let err = Error::validation("bad cron expression");
        assert_eq!(err.to_string(), "validation error: bad cron expression");
    }
}
