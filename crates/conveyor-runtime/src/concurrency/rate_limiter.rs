//! Sliding-window-by-bucket rate limiter: an integer counter per
//! `(type, window)` with TTL equal to the window length.

use std::time::Duration;

use conveyor_core::store::Datastore;
use tracing::instrument;

use super::Result;

/// A rate limiter scoped to one `type` tag, stored at `ratelimit:<type>`.
#[derive(Clone)]
pub struct RateLimiter {
    datastore: Datastore,
    type_tag: String,
    limit: i64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(datastore: Datastore, type_tag: impl Into<String>, limit: i64, window: Duration) -> Self {
        Self {
            datastore,
            type_tag: type_tag.into(),
            limit,
            window,
        }
    }

    fn full_key(&self) -> String {
        self.datastore.key(&format!("ratelimit:{}", self.type_tag))
    }

    /// Increment the counter for the current window and report whether
    /// this call is within the limit. The first increment in a window
    /// sets the TTL to the window length.
    #[instrument(skip(self), fields(type_tag = %self.type_tag))]
    pub async fn allow(&self) -> Result<bool> {
        let key = self.full_key();
        let count = self
            .datastore
            .incr(&key)
            .await
            .map_err(conveyor_core::error::Error::from)?;

        if count == 1 {
            self.datastore
                .expire(&key, self.window)
                .await
                .map_err(conveyor_core::error::Error::from)?;
        }

        Ok(count <= self.limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_naming() {
        let type_tag = "send_email";
        assert_eq!(format!("ratelimit:{type_tag}"), "ratelimit:send_email");
    }
}
