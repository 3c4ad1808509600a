//! Datastore facade: a thin typed wrapper over the Redis-compatible wire
//! protocol. Every other crate in the workspace goes through this instead
//! of touching `redis` directly, so the key namespace and error mapping
//! stay in one place.
//!
//! Only commands native to the Redis protocol are used; nothing here
//! depends on a DragonflyDB-specific extension.

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use tracing::instrument;

use crate::config::DatastoreConfig;
use crate::error::{Error, Result};

/// A stream entry read back from `XRANGE`/`XREAD`: its ID and field map.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Outcome of a `SET ... NX` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetNxOutcome {
    /// The key did not exist and was set.
    Set,
    /// The key already existed; nothing was written.
    AlreadyExists,
}

/// Typed facade over the Redis-compatible wire protocol.
///
/// Cheap to clone: it wraps a `ConnectionManager`, which is itself a
/// cheaply-cloneable handle that reconnects transparently.
#[derive(Clone)]
pub struct Datastore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl Datastore {
    /// Connect to the configured datastore.
    #[instrument(skip(config), fields(url = %config.url))]
    pub async fn connect(config: &DatastoreConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| Error::validation(format!("invalid redis url: {e}")))?;
        let conn = tokio::time::timeout(config.connect_timeout, client.get_connection_manager())
            .await
            .map_err(|_| Error::timeout("connecting to datastore"))?
            .map_err(Error::from)?;

        Ok(Self {
            conn,
            key_prefix: config.key_prefix.clone(),
        })
    }

    /// Build a namespaced key: `<prefix>:<suffix>`.
    pub fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.key_prefix, suffix)
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    // =====================================================================
    // Strings
    // =====================================================================

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = self.conn().get(key).await.map_err(Error::from)?;
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let _: () = self.conn().set(key, value).await.map_err(Error::from)?;
        Ok(())
    }

    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let _: () = self
            .conn()
            .set_ex(key, value, ttl.as_secs().max(1))
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    /// `SET key value NX PX <ttl_ms>` — used by the distributed lock.
    pub async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<SetNxOutcome> {
        let result: RedisResult<Option<String>> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut self.conn())
            .await;

        match result.map_err(Error::from)? {
            Some(_) => Ok(SetNxOutcome::Set),
            None => Ok(SetNxOutcome::AlreadyExists),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let _: () = self.conn().del(key).await.map_err(Error::from)?;
        Ok(())
    }

    pub async fn incr(&self, key: &str) -> Result<i64> {
        let value: i64 = self.conn().incr(key, 1).await.map_err(Error::from)?;
        Ok(value)
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let _: () = self
            .conn()
            .expire(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    /// Run a Lua script server-side (used for compare-and-delete /
    /// compare-and-extend on locks and similar atomic read-modify-write
    /// operations that a single command can't express).
    pub async fn eval_script(
        &self,
        script: &str,
        keys: &[&str],
        args: &[&str],
    ) -> Result<i64> {
        let mut invocation = redis::Script::new(script).prepare_invoke();
        for k in keys {
            invocation.key(*k);
        }
        for a in args {
            invocation.arg(*a);
        }
        let result: i64 = invocation
            .invoke_async(&mut self.conn())
            .await
            .map_err(Error::from)?;
        Ok(result)
    }

    // =====================================================================
    // Lists
    // =====================================================================

    pub async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        let _: () = self.conn().lpush(key, value).await.map_err(Error::from)?;
        Ok(())
    }

    /// `BRPOP key timeout`. Returns `None` if the timeout elapsed without
    /// a value arriving — this is not an error.
    pub async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let result: Option<(String, String)> = self
            .conn()
            .brpop(key, timeout.as_secs_f64())
            .await
            .map_err(Error::from)?;
        Ok(result.map(|(_, value)| value))
    }

    /// Non-blocking pop from the tail, used where a blocking round-trip
    /// isn't appropriate (e.g. polling several shards).
    pub async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = self.conn().rpop(key, None).await.map_err(Error::from)?;
        Ok(value)
    }

    pub async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let values: Vec<String> = self
            .conn()
            .lrange(key, start, stop)
            .await
            .map_err(Error::from)?;
        Ok(values)
    }

    pub async fn lindex(&self, key: &str, index: isize) -> Result<Option<String>> {
        let value: Option<String> = self.conn().lindex(key, index).await.map_err(Error::from)?;
        Ok(value)
    }

    pub async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let _: () = self
            .conn()
            .ltrim(key, start, stop)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    /// `LREM key 0 value` — remove every occurrence by value, which
    /// tolerates concurrent index shifts (e.g. DLQ retry racing another
    /// retry).
    pub async fn lrem_all(&self, key: &str, value: &str) -> Result<i64> {
        let removed: i64 = self
            .conn()
            .lrem(key, 0, value)
            .await
            .map_err(Error::from)?;
        Ok(removed)
    }

    pub async fn llen(&self, key: &str) -> Result<i64> {
        let len: i64 = self.conn().llen(key).await.map_err(Error::from)?;
        Ok(len)
    }

    // =====================================================================
    // Sorted sets
    // =====================================================================

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let _: () = self
            .conn()
            .zadd(key, member, score)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    /// Pop the highest-scored member, if any.
    pub async fn zpopmax(&self, key: &str) -> Result<Option<(String, f64)>> {
        let result: Vec<(String, f64)> = self.conn().zpopmax(key, 1).await.map_err(Error::from)?;
        Ok(result.into_iter().next())
    }

    /// Peek the highest-scored member without removing it.
    pub async fn zrevrange_first(&self, key: &str) -> Result<Option<String>> {
        let result: Vec<String> = self
            .conn()
            .zrevrange(key, 0, 0)
            .await
            .map_err(Error::from)?;
        Ok(result.into_iter().next())
    }

    pub async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>> {
        let result: Vec<String> = self
            .conn()
            .zrangebyscore(key, min, max)
            .await
            .map_err(Error::from)?;
        Ok(result)
    }

    pub async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let _: () = self.conn().zrem(key, member).await.map_err(Error::from)?;
        Ok(())
    }

    pub async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<i64> {
        let removed: i64 = self
            .conn()
            .zrembyscore(key, min, max)
            .await
            .map_err(Error::from)?;
        Ok(removed)
    }

    pub async fn zcard(&self, key: &str) -> Result<i64> {
        let card: i64 = self.conn().zcard(key).await.map_err(Error::from)?;
        Ok(card)
    }

    // =====================================================================
    // Hashes
    // =====================================================================

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let _: () = self
            .conn()
            .hset(key, field, value)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let value: Option<String> = self.conn().hget(key, field).await.map_err(Error::from)?;
        Ok(value)
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let map: HashMap<String, String> = self.conn().hgetall(key).await.map_err(Error::from)?;
        Ok(map)
    }

    pub async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let value: i64 = self
            .conn()
            .hincr(key, field, delta)
            .await
            .map_err(Error::from)?;
        Ok(value)
    }

    // =====================================================================
    // Streams
    // =====================================================================

    /// `XADD key MAXLEN ~ <maxlen> * field value ...`
    pub async fn xadd(
        &self,
        key: &str,
        maxlen: usize,
        fields: &[(&str, &str)],
    ) -> Result<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key).arg("MAXLEN").arg("~").arg(maxlen).arg("*");
        for (field, value) in fields {
            cmd.arg(*field).arg(*value);
        }
        let id: String = cmd.query_async(&mut self.conn()).await.map_err(Error::from)?;
        Ok(id)
    }

    pub async fn xrange(&self, key: &str, start: &str, end: &str) -> Result<Vec<StreamRecord>> {
        let raw: Vec<(String, HashMap<String, String>)> = self
            .conn()
            .xrange(key, start, end)
            .await
            .map_err(Error::from)?;
        Ok(raw
            .into_iter()
            .map(|(id, fields)| StreamRecord { id, fields })
            .collect())
    }

    pub async fn xrevrange(&self, key: &str, start: &str, end: &str) -> Result<Vec<StreamRecord>> {
        let raw: Vec<(String, HashMap<String, String>)> = self
            .conn()
            .xrevrange(key, start, end)
            .await
            .map_err(Error::from)?;
        Ok(raw
            .into_iter()
            .map(|(id, fields)| StreamRecord { id, fields })
            .collect())
    }

    /// `XREAD BLOCK <block_ms> COUNT <count> STREAMS key cursor`
    pub async fn xread_block(
        &self,
        key: &str,
        cursor: &str,
        block: Duration,
        count: usize,
    ) -> Result<Vec<StreamRecord>> {
        let mut cmd = redis::cmd("XREAD");
        cmd.arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(key)
            .arg(cursor);

        let reply: redis::Value = cmd
            .query_async(&mut self.conn())
            .await
            .map_err(Error::from)?;

        Ok(parse_xread_reply(reply))
    }

    // =====================================================================
    // Pub/sub
    // =====================================================================

    pub async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let _: () = self
            .conn()
            .publish(channel, message)
            .await
            .map_err(Error::from)?;
        Ok(())
    }
}

/// Parse the nested `XREAD` reply shape into a flat list of records.
///
/// Uses the `redis` 0.27 `Value` variant names (`Array`/`BulkString`/
/// `SimpleString`, the post-0.25 rename of the older `Bulk`/`Data`/
/// `Status` names).
fn parse_xread_reply(reply: redis::Value) -> Vec<StreamRecord> {
    use redis::Value;

    fn as_string(v: &Value) -> Option<String> {
        match v {
            Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
            Value::SimpleString(s) => Some(s.clone()),
            _ => None,
        }
    }

    let mut out = Vec::new();
    let Value::Array(streams) = reply else {
        return out;
    };

    for stream in streams {
        let Value::Array(stream_pair) = stream else {
            continue;
        };
        // stream_pair = [stream_name, entries]
        if stream_pair.len() != 2 {
            continue;
        }
        let Value::Array(entries) = &stream_pair[1] else {
            continue;
        };

        for entry in entries {
            let Value::Array(entry_parts) = entry else {
                continue;
            };
            if entry_parts.len() != 2 {
                continue;
            }
            let Some(id) = as_string(&entry_parts[0]) else {
                continue;
            };
            let Value::Array(field_values) = &entry_parts[1] else {
                continue;
            };
            let mut fields = HashMap::new();
            let mut it = field_values.iter();
            while let (Some(k), Some(v)) = (it.next(), it.next()) {
                let (Some(key), Some(value)) = (as_string(k), as_string(v)) else {
                    continue;
                };
                fields.insert(key, value);
            }
            out.push(StreamRecord { id, fields });
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_namespacing() {
        // Datastore::key is pure string formatting, testable without a connection.
        let prefix = "conveyor";
        let suffix = "jobs:default";
        assert_eq!(format!("{prefix}:{suffix}"), "conveyor:jobs:default");
    }

    #[test]
    fn test_parse_xread_reply_empty() {
        let reply = redis::Value::Array(vec![]);
        assert!(parse_xread_reply(reply).is_empty());
    }
}
