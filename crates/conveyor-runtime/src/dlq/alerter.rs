//! Pluggable DLQ alerters: webhook, chat-integration webhook, log-sink,
//! and callback.

use async_trait::async_trait;
use tracing::error;

use super::DlqEntry;

/// Receives a DLQ entry and reports on it. Errors are logged by the
/// caller but never propagated — one failing alerter must not block
/// others.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn notify(&self, entry: &DlqEntry) -> Result<(), String>;

    /// A short label used in logs when this alerter fails.
    fn name(&self) -> &str;
}

/// POSTs the entry as JSON to an arbitrary HTTP endpoint.
pub struct WebhookAlerter {
    label: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookAlerter {
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Alerter for WebhookAlerter {
    async fn notify(&self, entry: &DlqEntry) -> Result<(), String> {
        self.client
            .post(&self.url)
            .json(entry)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// POSTs a human-readable summary to a chat-integration webhook (Slack,
/// Discord, etc. — any endpoint that accepts `{"text": "..."}`).
pub struct ChatAlerter {
    label: String,
    url: String,
    client: reqwest::Client,
}

impl ChatAlerter {
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Alerter for ChatAlerter {
    async fn notify(&self, entry: &DlqEntry) -> Result<(), String> {
        let text = format!(
            "job {} (type {}) hit the DLQ after {} attempts: {}",
            entry.job.id(),
            entry.job.job_type(),
            entry.attempts,
            entry.error
        );

        self.client
            .post(&self.url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Logs the entry at error level via `tracing`. The default choice when
/// no external sink is configured.
pub struct LogAlerter {
    label: String,
}

impl LogAlerter {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

impl Default for LogAlerter {
    fn default() -> Self {
        Self::new("log")
    }
}

#[async_trait]
impl Alerter for LogAlerter {
    async fn notify(&self, entry: &DlqEntry) -> Result<(), String> {
        error!(
            job_id = %entry.job.id(),
            job_type = %entry.job.job_type(),
            attempts = entry.attempts,
            worker_id = %entry.worker_id,
            error = %entry.error,
            "job moved to DLQ"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        &self.label
    }
}

type CallbackFn =
    dyn Fn(&DlqEntry) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>>
        + Send
        + Sync;

/// Invokes an arbitrary in-process async closure for each entry. Used to
/// wire the DLQ into collaborator-specific notification paths without
/// this crate depending on them directly.
pub struct CallbackAlerter {
    label: String,
    callback: Box<CallbackFn>,
}

impl CallbackAlerter {
    pub fn new<F, Fut>(label: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&DlqEntry) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        Self {
            label: label.into(),
            callback: Box::new(move |entry| Box::pin(callback(entry))),
        }
    }
}

#[async_trait]
impl Alerter for CallbackAlerter {
    async fn notify(&self, entry: &DlqEntry) -> Result<(), String> {
        (self.callback)(entry).await
    }

    fn name(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn sample_entry() -> DlqEntry {
        DlqEntry {
            job: conveyor_core::job::Job::new("send_email", json!({})),
            error: "boom".to_string(),
            failed_at: chrono::Utc::now(),
            attempts: 3,
            worker_id: "worker-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_log_alerter_never_errors() {
        let alerter = LogAlerter::default();
        assert!(alerter.notify(&sample_entry()).await.is_ok());
    }

    #[tokio::test]
    async fn test_callback_alerter_invokes_closure() {
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = Arc::clone(&called);

        let alerter = CallbackAlerter::new("test", move |_entry| {
            let called = Arc::clone(&called_clone);
            async move {
                called.store(true, Ordering::SeqCst);
                Ok(())
            }
        });

        alerter.notify(&sample_entry()).await.unwrap();
        assert!(called.load(Ordering::SeqCst));
    }
}
