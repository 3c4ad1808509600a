//! Append-only lifecycle event log: a global stream and a per-job stream,
//! both bounded by `XADD ... MAXLEN ~`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conveyor_core::job::JobId;
use conveyor_core::store::Datastore;
use serde::{Deserialize, Serialize};
use tracing::instrument;

const GLOBAL_STREAM_MAXLEN: usize = 100_000;
const PER_JOB_STREAM_MAXLEN: usize = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error(transparent)]
    Core(#[from] conveyor_core::error::Error),
}

pub type Result<T> = std::result::Result<T, EventError>;

/// Lifecycle transition kinds an [`Event`] can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Queued,
    Started,
    Completed,
    Failed,
    Retried,
    Dlq,
}

impl EventKind {
    fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Queued => "queued",
            EventKind::Started => "started",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Retried => "retried",
            EventKind::Dlq => "dlq",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(EventKind::Created),
            "queued" => Some(EventKind::Queued),
            "started" => Some(EventKind::Started),
            "completed" => Some(EventKind::Completed),
            "failed" => Some(EventKind::Failed),
            "retried" => Some(EventKind::Retried),
            "dlq" => Some(EventKind::Dlq),
            _ => None,
        }
    }
}

/// An immutable lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    pub job_id: JobId,
    pub job_type: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub queue: Option<String>,
    pub data: HashMap<String, String>,
}

impl Event {
    pub fn new(kind: EventKind, job_id: JobId, job_type: impl Into<String>) -> Self {
        Self {
            id: new_event_id(),
            kind,
            job_id,
            job_type: job_type.into(),
            timestamp: Utc::now(),
            duration_ms: None,
            error: None,
            queue: None,
            data: HashMap::new(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Tag this event with the queue it belongs to, so per-queue stats can
    /// filter the global stream down to one queue's transitions.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("id", self.id.clone()),
            ("kind", self.kind.as_str().to_string()),
            ("job_id", self.job_id.to_string()),
            ("job_type", self.job_type.clone()),
            ("timestamp", self.timestamp.to_rfc3339()),
        ];
        if let Some(duration_ms) = self.duration_ms {
            fields.push(("duration_ms", duration_ms.to_string()));
        }
        if let Some(error) = &self.error {
            fields.push(("error", error.clone()));
        }
        if let Some(queue) = &self.queue {
            fields.push(("queue", queue.clone()));
        }
        if let Ok(data_json) = serde_json::to_string(&self.data) {
            fields.push(("data", data_json));
        }
        fields
    }

    fn from_record(record: &conveyor_core::store::StreamRecord) -> Option<Self> {
        let fields = &record.fields;
        let kind = EventKind::from_str(fields.get("kind")?)?;
        let timestamp = DateTime::parse_from_rfc3339(fields.get("timestamp")?)
            .ok()?
            .with_timezone(&Utc);
        let data = fields
            .get("data")
            .and_then(|d| serde_json::from_str(d).ok())
            .unwrap_or_default();

        Some(Self {
            id: fields.get("id")?.clone(),
            kind,
            job_id: JobId::from_string(fields.get("job_id")?.clone()),
            job_type: fields.get("job_type")?.clone(),
            timestamp,
            duration_ms: fields.get("duration_ms").and_then(|d| d.parse().ok()),
            error: fields.get("error").cloned(),
            queue: fields.get("queue").cloned(),
            data,
        })
    }
}

fn new_event_id() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Appends lifecycle events to the global and per-job streams and reads
/// them back for history or subscription.
#[derive(Clone)]
pub struct EventStream {
    datastore: Datastore,
}

impl EventStream {
    pub fn new(datastore: Datastore) -> Self {
        Self { datastore }
    }

    fn global_key(&self) -> String {
        self.datastore.key("events:all")
    }

    fn job_key(&self, job_id: &JobId) -> String {
        self.datastore.key(&format!("events:job:{job_id}"))
    }

    /// Append one event to both the global and the per-job stream.
    #[instrument(skip(self, event), fields(job_id = %event.job_id, kind = ?event.kind))]
    pub async fn append(&self, event: &Event) -> Result<()> {
        let fields = event.to_fields();
        let field_refs: Vec<(&str, &str)> =
            fields.iter().map(|(k, v)| (*k, v.as_str())).collect();

        self.datastore
            .xadd(&self.global_key(), GLOBAL_STREAM_MAXLEN, &field_refs)
            .await
            .map_err(conveyor_core::error::Error::from)?;
        self.datastore
            .xadd(
                &self.job_key(&event.job_id),
                PER_JOB_STREAM_MAXLEN,
                &field_refs,
            )
            .await
            .map_err(conveyor_core::error::Error::from)?;

        Ok(())
    }

    /// Oldest-to-newest history for one job.
    pub async fn job_history(&self, job_id: &JobId) -> Result<Vec<Event>> {
        let records = self
            .datastore
            .xrange(&self.job_key(job_id), "-", "+")
            .await
            .map_err(conveyor_core::error::Error::from)?;
        Ok(records.iter().filter_map(Event::from_record).collect())
    }

    /// Newest-to-oldest history across every job.
    pub async fn global_history(&self, limit: usize) -> Result<Vec<Event>> {
        let records = self
            .datastore
            .xrevrange(&self.global_key(), "+", "-")
            .await
            .map_err(conveyor_core::error::Error::from)?;
        Ok(records
            .iter()
            .take(limit)
            .filter_map(Event::from_record)
            .collect())
    }

    /// Count `Completed`/`Failed` events recorded since `since`, scanning
    /// the global stream newest-to-oldest and stopping as soon as an
    /// event older than `since` is reached. When `queue` is `Some`, only
    /// events tagged with that queue name are counted.
    pub async fn count_completed_failed_since(
        &self,
        queue: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<(u64, u64)> {
        let records = self
            .datastore
            .xrevrange(&self.global_key(), "+", "-")
            .await
            .map_err(conveyor_core::error::Error::from)?;

        let mut completed = 0u64;
        let mut failed = 0u64;
        for record in &records {
            let Some(event) = Event::from_record(record) else {
                continue;
            };
            if event.timestamp < since {
                break;
            }
            if let Some(queue) = queue {
                if event.queue.as_deref() != Some(queue) {
                    continue;
                }
            }
            match event.kind {
                EventKind::Completed => completed += 1,
                EventKind::Failed => failed += 1,
                _ => {}
            }
        }
        Ok((completed, failed))
    }

    /// Call `handler` for each new event arriving on the global stream,
    /// starting from `$` (only events appended after this call). The
    /// cursor advances to the last record's ID on each iteration; the
    /// caller drives the loop (e.g. by selecting against a shutdown
    /// signal) and this call blocks up to 5 s per round, batching 100.
    pub async fn subscribe<F>(&self, mut handler: F) -> Result<()>
    where
        F: FnMut(Event),
    {
        let mut cursor = "$".to_string();
        loop {
            let records = self
                .datastore
                .xread_block(&self.global_key(), &cursor, Duration::from_secs(5), 100)
                .await
                .map_err(conveyor_core::error::Error::from)?;

            if records.is_empty() {
                continue;
            }

            for record in &records {
                if let Some(event) = Event::from_record(record) {
                    handler(event);
                }
            }
            cursor = records.last().unwrap().id.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_round_trips_through_str() {
        for kind in [
            EventKind::Created,
            EventKind::Queued,
            EventKind::Started,
            EventKind::Completed,
            EventKind::Failed,
            EventKind::Retried,
            EventKind::Dlq,
        ] {
            assert_eq!(EventKind::from_str(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_event_new_sets_id_and_timestamp() {
        let event = Event::new(EventKind::Queued, JobId::new(), "send_email");
        assert_eq!(event.id.len(), 32);
        assert_eq!(event.kind, EventKind::Queued);
    }

    #[test]
    fn test_to_fields_round_trips_through_from_record() {
        let event = Event::new(EventKind::Failed, JobId::new(), "charge_card")
            .with_error("boom")
            .with_duration(Duration::from_millis(42));

        let fields: HashMap<String, String> = event
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let record = conveyor_core::store::StreamRecord {
            id: "1-0".to_string(),
            fields,
        };

        let restored = Event::from_record(&record).unwrap();
        assert_eq!(restored.kind, EventKind::Failed);
        assert_eq!(restored.job_type, "charge_card");
        assert_eq!(restored.error.as_deref(), Some("boom"));
        assert_eq!(restored.duration_ms, Some(42));
    }
}
