//! The Job record: identity, serialization, and fluent mutators.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique opaque job identity: 128 bits of entropy, hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a new identity from 128 bits of entropy.
    pub fn new() -> Self {
        let bytes: [u8; 16] = rand::random();
        let hex = bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap an already-known ID string (e.g. read back from the datastore).
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire representation of a [`Job`]; deterministic JSON matching spec §6.
///
/// `extra` captures any fields this version of the crate doesn't know
/// about so that a round-trip through an older/newer writer doesn't drop
/// them silently.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobDto {
    id: JobId,
    #[serde(rename = "type")]
    job_type: String,
    payload: serde_json::Value,
    priority: i64,
    created_at: DateTime<Utc>,
    attempts: u32,
    max_retries: u32,
    metadata: HashMap<String, String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// The minimal unit of work.
///
/// Identity, type, and payload are immutable once the job is constructed.
/// The attempt count only increases. Metadata mutation is serialized by an
/// internal read-write lock — per the workspace-wide rule that shared
/// mutable state is never touched outside its guarding lock, callers only
/// ever see copies of the metadata map.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    job_type: String,
    payload: serde_json::Value,
    priority: i64,
    created_at: DateTime<Utc>,
    attempts: u32,
    max_retries: u32,
    metadata: RwLock<HashMap<String, String>>,
    extra: serde_json::Map<String, serde_json::Value>,
}

impl Job {
    /// Create a new job with FIFO priority (0) and no retries.
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            priority: 0,
            created_at: Utc::now(),
            attempts: 0,
            max_retries: 0,
            metadata: RwLock::new(HashMap::new()),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_metadata(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .write()
            .unwrap()
            .insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether the retry budget has been exhausted (next failure is terminal).
    pub fn retries_exhausted(&self) -> bool {
        self.attempts > self.max_retries
    }

    /// Monotonically bump the attempt counter. Never goes backwards.
    pub fn increment_attempts(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Reset the attempt counter (used when retrying a DLQ entry).
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
    }

    /// Return a snapshot copy of the metadata map.
    pub fn metadata_snapshot(&self) -> HashMap<String, String> {
        self.metadata.read().unwrap().clone()
    }

    /// Insert or overwrite a metadata entry under the guarding lock.
    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.write().unwrap().insert(key.into(), value.into());
    }

    pub fn metadata_get(&self, key: &str) -> Option<String> {
        self.metadata.read().unwrap().get(key).cloned()
    }

    /// Annotate with the worker instance that is currently handling it.
    pub fn annotate_worker(&self, worker_id: &str) {
        self.set_metadata("worker_id", worker_id);
    }

    /// Annotate with a DLQ failure reason and timestamp.
    pub fn annotate_dlq_reason(&self, reason: &str) {
        self.set_metadata("dlq_reason", reason);
        self.set_metadata("dlq_at", Utc::now().to_rfc3339());
    }

    fn to_dto(&self) -> JobDto {
        JobDto {
            id: self.id.clone(),
            job_type: self.job_type.clone(),
            payload: self.payload.clone(),
            priority: self.priority,
            created_at: self.created_at,
            attempts: self.attempts,
            max_retries: self.max_retries,
            metadata: self.metadata_snapshot(),
            extra: self.extra.clone(),
        }
    }

    /// Serialize to the wire JSON form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_dto())
    }

    /// Deserialize from the wire JSON form. A payload that fails to parse
    /// should be routed to the DLQ with reason "corrupt-payload" by the
    /// caller (see spec §4.1 edge-case policy) rather than propagated.
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        let dto: JobDto = serde_json::from_str(data)?;
        Ok(Self {
            id: dto.id,
            job_type: dto.job_type,
            payload: dto.payload,
            priority: dto.priority,
            created_at: dto.created_at,
            attempts: dto.attempts,
            max_retries: dto.max_retries,
            metadata: RwLock::new(dto.metadata),
            extra: dto.extra,
        })
    }
}

impl Clone for Job {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            job_type: self.job_type.clone(),
            payload: self.payload.clone(),
            priority: self.priority,
            created_at: self.created_at,
            attempts: self.attempts,
            max_retries: self.max_retries,
            metadata: RwLock::new(self.metadata_snapshot()),
            extra: self.extra.clone(),
        }
    }
}

impl Serialize for Job {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_dto().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Job {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let dto = JobDto::deserialize(deserializer)?;
        Ok(Self {
            id: dto.id,
            job_type: dto.job_type,
            payload: dto.payload,
            priority: dto.priority,
            created_at: dto.created_at,
            attempts: dto.attempts,
            max_retries: dto.max_retries,
            metadata: RwLock::new(dto.metadata),
            extra: dto.extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_id_is_32_hex_chars() {
        let id = JobId::new();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_job_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }

    #[test]
    fn test_new_job_defaults() {
        let job = Job::new("send_email", json!({"to": "a@example.com"}));
        assert_eq!(job.job_type(), "send_email");
        assert_eq!(job.priority(), 0);
        assert_eq!(job.attempts(), 0);
        assert_eq!(job.max_retries(), 0);
    }

    #[test]
    fn test_increment_attempts_monotonic() {
        let mut job = Job::new("t", json!({}));
        job.increment_attempts();
        job.increment_attempts();
        assert_eq!(job.attempts(), 2);
    }

    #[test]
    fn test_retries_exhausted() {
        let mut job = Job::new("t", json!({})).with_max_retries(2);
        assert!(!job.retries_exhausted());
        job.increment_attempts();
        job.increment_attempts();
        assert!(!job.retries_exhausted());
        job.increment_attempts();
        assert!(job.retries_exhausted());
    }

    #[test]
    fn test_metadata_mutation_is_visible_through_snapshot() {
        let job = Job::new("t", json!({})).with_metadata("source", "webhook");
        job.set_metadata("retry_reason", "timeout");

        let snapshot = job.metadata_snapshot();
        assert_eq!(snapshot.get("source").map(String::as_str), Some("webhook"));
        assert_eq!(
            snapshot.get("retry_reason").map(String::as_str),
            Some("timeout")
        );
    }

    #[test]
    fn test_round_trip_json() {
        let job = Job::new("charge_card", json!({"amount": 500}))
            .with_priority(10)
            .with_max_retries(3)
            .with_metadata("tenant", "acme");

        let json_str = job.to_json().unwrap();
        let restored = Job::from_json(&json_str).unwrap();

        assert_eq!(restored.id(), job.id());
        assert_eq!(restored.job_type(), job.job_type());
        assert_eq!(restored.payload(), job.payload());
        assert_eq!(restored.priority(), job.priority());
        assert_eq!(restored.max_retries(), job.max_retries());
        assert_eq!(restored.metadata_snapshot(), job.metadata_snapshot());
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        let raw = json!({
            "id": "0123456789abcdef0123456789abcdef",
            "type": "noop",
            "payload": {},
            "priority": 0,
            "created_at": Utc::now().to_rfc3339(),
            "attempts": 0,
            "max_retries": 0,
            "metadata": {},
            "from_future_version": "keep-me"
        });

        let job = Job::from_json(&raw.to_string()).unwrap();
        let round_tripped: serde_json::Value =
            serde_json::from_str(&job.to_json().unwrap()).unwrap();

        assert_eq!(
            round_tripped.get("from_future_version"),
            Some(&json!("keep-me"))
        );
    }

    #[test]
    fn test_corrupt_payload_is_an_error_not_a_panic() {
        let result = Job::from_json("{ not json");
        assert!(result.is_err());
    }
}
