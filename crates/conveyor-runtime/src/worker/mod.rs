//! Worker pool: a per-type handler registry dispatched across a
//! configurable number of concurrent dequeue loops, with retry+DLQ
//! failure handling and graceful shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use conveyor_core::job::Job;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::dlq::DlqSink;
use crate::events::{Event, EventKind, EventStream};
use crate::queue::JobSource;

#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("worker pool is already running")]
    AlreadyRunning,
    #[error("worker pool is not running")]
    NotRunning,
    #[error("graceful shutdown timed out with {0} handlers still in flight")]
    ShutdownTimeout(usize),
}

pub type Result<T> = std::result::Result<T, WorkerPoolError>;

/// `(job) -> Result<(), error message>`. The context/cancellation handle
/// is threaded through via `Cancellation` rather than a generic `ctx`
/// type parameter, matching spec.md §4.2's "(ctx, job) → error" contract.
pub type HandlerResult = std::result::Result<(), String>;
pub type Handler = Arc<
    dyn Fn(Job, Cancellation) -> std::pin::Pin<Box<dyn std::future::Future<Output = HandlerResult> + Send>>
        + Send
        + Sync,
>;

/// A cooperative cancellation handle: both the pool's internal stop
/// signal and a caller-supplied handle terminate a loop. In-flight
/// handlers receive the same handle and must honour it at their own
/// suspension points.
#[derive(Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn cancelled(&mut self) {
        let _ = self.rx.changed().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Tunables for a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    pub dequeue_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            dequeue_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            ..Default::default()
        }
    }

    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// A pool of `concurrency` independent dequeue loops sharing one handler
/// registry and one job source.
pub struct WorkerPool {
    source: Arc<dyn JobSource>,
    dlq: Option<Arc<DlqSink>>,
    events: Option<EventStream>,
    config: WorkerPoolConfig,
    handlers: RwLock<HashMap<String, Handler>>,
    max_retries: RwLock<HashMap<String, u32>>,
    status: RwLock<WorkerPoolStatus>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    in_flight: Arc<AtomicUsize>,
    loop_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    worker_id: String,
}

impl WorkerPool {
    pub fn new(source: Arc<dyn JobSource>, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            source,
            dlq: None,
            events: None,
            config,
            handlers: RwLock::new(HashMap::new()),
            max_retries: RwLock::new(HashMap::new()),
            status: RwLock::new(WorkerPoolStatus::Stopped),
            shutdown_tx,
            shutdown_rx,
            in_flight: Arc::new(AtomicUsize::new(0)),
            loop_handles: std::sync::Mutex::new(Vec::new()),
            worker_id: format!("worker-{}", conveyor_core::job::JobId::new()),
        }
    }

    pub fn with_dlq(mut self, dlq: Arc<DlqSink>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    /// Attach an event stream so every dequeue/success/failure/DLQ
    /// transition this pool drives is appended (spec §4.4, §8 scenario 2).
    pub fn with_events(mut self, events: EventStream) -> Self {
        self.events = Some(events);
        self
    }

    /// Register a handler for `job_type`, retrying up to `max_retries`
    /// times before forwarding to the DLQ. If no handler is registered
    /// for a dequeued job's type, the job is silently dropped from this
    /// worker — other workers in a heterogeneous fleet may still handle
    /// it.
    pub fn register_handler<F, Fut>(&self, job_type: impl Into<String>, max_retries: u32, handler: F)
    where
        F: Fn(Job, Cancellation) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        let job_type = job_type.into();
        let handler: Handler = Arc::new(move |job, cancel| Box::pin(handler(job, cancel)));
        self.handlers.write().unwrap().insert(job_type.clone(), handler);
        self.max_retries.write().unwrap().insert(job_type, max_retries);
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read().unwrap()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Launch `concurrency` independent dequeue loops.
    #[instrument(skip(self), fields(worker_id = %self.worker_id, concurrency = self.config.concurrency))]
    pub fn start(&self) {
        if *self.status.read().unwrap() == WorkerPoolStatus::Running {
            return;
        }

        info!(worker_id = %self.worker_id, "starting worker pool");
        *self.status.write().unwrap() = WorkerPoolStatus::Running;

        let mut handles = Vec::with_capacity(self.config.concurrency);
        for loop_index in 0..self.config.concurrency {
            handles.push(self.spawn_loop(loop_index));
        }
        *self.loop_handles.lock().unwrap() = handles;
    }

    fn spawn_loop(&self, loop_index: usize) -> JoinHandle<()> {
        let source = Arc::clone(&self.source);
        let dlq = self.dlq.clone();
        let events = self.events.clone();
        let dequeue_timeout = self.config.dequeue_timeout;
        let handlers = Arc::new(self.handlers.read().unwrap().clone());
        let max_retries = Arc::new(self.max_retries.read().unwrap().clone());
        let in_flight = Arc::clone(&self.in_flight);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let worker_id = self.worker_id.clone();
        let queue_name = source.name().to_string();

        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    debug!(worker_id = %worker_id, loop_index, "loop shutting down");
                    break;
                }

                let dequeued = tokio::select! {
                    result = source.dequeue(dequeue_timeout) => result,
                    _ = shutdown_rx.changed() => break,
                };

                let job = match dequeued {
                    Ok(Some(job)) => job,
                    Ok(None) => continue,
                    Err(e) => {
                        error!(worker_id = %worker_id, loop_index, error = %e, "dequeue failed");
                        continue;
                    }
                };

                let Some(handler) = handlers.get(job.job_type()).cloned() else {
                    warn!(worker_id = %worker_id, job_type = job.job_type(), "no handler registered, dropping");
                    continue;
                };

                in_flight.fetch_add(1, Ordering::SeqCst);
                let cancel = Cancellation { rx: shutdown_rx.clone() };
                job.annotate_worker(&worker_id);

                if let Some(events) = &events {
                    let event = Event::new(EventKind::Started, job.id().clone(), job.job_type())
                        .with_queue(queue_name.clone());
                    if let Err(e) = events.append(&event).await {
                        warn!(worker_id = %worker_id, job_id = %job.id(), error = %e, "failed to append started event");
                    }
                }

                let started_at = tokio::time::Instant::now();
                let result = handler(job.clone(), cancel).await;
                let elapsed = started_at.elapsed();
                in_flight.fetch_sub(1, Ordering::SeqCst);

                match result {
                    Ok(()) => {
                        if let Some(events) = &events {
                            let event = Event::new(EventKind::Completed, job.id().clone(), job.job_type())
                                .with_duration(elapsed)
                                .with_queue(queue_name.clone());
                            if let Err(e) = events.append(&event).await {
                                warn!(worker_id = %worker_id, job_id = %job.id(), error = %e, "failed to append completed event");
                            }
                        }
                    }
                    Err(error) => {
                        if let Some(events) = &events {
                            let event = Event::new(EventKind::Failed, job.id().clone(), job.job_type())
                                .with_duration(elapsed)
                                .with_error(error.clone())
                                .with_queue(queue_name.clone());
                            if let Err(e) = events.append(&event).await {
                                warn!(worker_id = %worker_id, job_id = %job.id(), error = %e, "failed to append failed event");
                            }
                        }

                        let mut job = job;
                        job.increment_attempts();
                        let limit = max_retries.get(job.job_type()).copied().unwrap_or(0);

                        if job.attempts() <= limit {
                            if let Err(e) = source.requeue(&job).await {
                                error!(worker_id = %worker_id, job_id = %job.id(), error = %e, "re-enqueue failed");
                            }
                        } else {
                            if let Some(events) = &events {
                                let event = Event::new(EventKind::Dlq, job.id().clone(), job.job_type())
                                    .with_error(error.clone())
                                    .with_queue(queue_name.clone());
                                if let Err(e) = events.append(&event).await {
                                    warn!(worker_id = %worker_id, job_id = %job.id(), error = %e, "failed to append dlq event");
                                }
                            }
                            if let Some(dlq) = &dlq {
                                if let Err(e) = dlq.add(job, error, worker_id.clone()).await {
                                    error!(worker_id = %worker_id, error = %e, "DLQ add failed");
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    /// Signal shutdown and wait for in-flight handlers to drain, up to
    /// `shutdown_timeout`.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn shutdown(&self) -> Result<()> {
        if *self.status.read().unwrap() == WorkerPoolStatus::Stopped {
            return Ok(());
        }

        *self.status.write().unwrap() = WorkerPoolStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            if self.in_flight() == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(worker_id = %self.worker_id, in_flight = self.in_flight(), "shutdown timeout reached");
                return Err(WorkerPoolError::ShutdownTimeout(self.in_flight()));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let handles = std::mem::take(&mut *self.loop_handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }

        *self.status.write().unwrap() = WorkerPoolStatus::Stopped;
        info!(worker_id = %self.worker_id, "worker pool stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.dequeue_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_builder_clamps_concurrency() {
        let config = WorkerPoolConfig::new(0);
        assert_eq!(config.concurrency, 1);
    }
}
