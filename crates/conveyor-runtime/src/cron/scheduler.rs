//! Cron scheduler: holds a set of named schedules, each targeting a
//! workflow, and starts a run through a [`WorkflowEngine`] whenever a
//! schedule's `next_run` elapses (spec §4.9).
//!
//! Modeled on [`crate::delayed::DelayedScheduler`]'s persisted-ticker
//! shape, but schedules themselves are kept in memory (behind a
//! `RwLock`) since they are registered at process start, not job-scale
//! data that needs to survive independently of the process that owns
//! them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::workflow::WorkflowEngine;

use super::expr::{CronError, CronExpr};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Cron(#[from] CronError),
    #[error("schedule {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Engine(#[from] crate::workflow::WorkflowEngineError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// One registered cron schedule targeting a workflow.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: String,
    pub workflow_name: String,
    pub expr: CronExpr,
    pub input: Value,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
}

/// Holds registered schedules and drives a 1-second tick loop that
/// starts due workflows.
pub struct CronScheduler {
    engine: WorkflowEngine,
    schedules: RwLock<HashMap<String, Schedule>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl CronScheduler {
    pub fn new(engine: WorkflowEngine) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            engine,
            schedules: RwLock::new(HashMap::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Register a new schedule, returning its generated ID.
    #[instrument(skip(self, input), fields(workflow_name = %workflow_name, expr = %expr))]
    pub fn add_schedule(
        &self,
        workflow_name: impl Into<String>,
        expr: &str,
        input: Value,
    ) -> Result<String> {
        let parsed = CronExpr::parse(expr)?;
        let id = Uuid::new_v4().to_string();
        let next_run = parsed.next(Utc::now());
        let schedule = Schedule {
            id: id.clone(),
            workflow_name: workflow_name.into(),
            expr: parsed,
            input,
            enabled: true,
            last_run: None,
            next_run,
        };
        self.schedules.write().unwrap().insert(id.clone(), schedule);
        Ok(id)
    }

    pub fn remove_schedule(&self, id: &str) -> Result<()> {
        self.schedules
            .write()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    pub fn enable_schedule(&self, id: &str) -> Result<()> {
        self.set_enabled(id, true)
    }

    pub fn disable_schedule(&self, id: &str) -> Result<()> {
        self.set_enabled(id, false)
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut schedules = self.schedules.write().unwrap();
        let schedule = schedules
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        schedule.enabled = enabled;
        Ok(())
    }

    pub fn list_schedules(&self) -> Vec<Schedule> {
        self.schedules.read().unwrap().values().cloned().collect()
    }

    /// Run one pass: start every enabled schedule whose `next_run` has
    /// elapsed, then advance it.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Vec<(String, Result<String>)> {
        let now = Utc::now();
        let due: Vec<Schedule> = {
            let schedules = self.schedules.read().unwrap();
            schedules
                .values()
                .filter(|s| s.enabled && s.next_run <= now)
                .cloned()
                .collect()
        };

        let mut results = Vec::with_capacity(due.len());
        for schedule in due {
            let mut input = schedule.input.clone();
            if let Some(obj) = input.as_object_mut() {
                obj.insert("_cron_schedule_id".to_string(), Value::String(schedule.id.clone()));
                obj.insert(
                    "_cron_triggered_at".to_string(),
                    Value::String(now.to_rfc3339()),
                );
            }

            let outcome = self
                .engine
                .start(&schedule.workflow_name, input)
                .await
                .map_err(SchedulerError::from);

            if let Err(e) = &outcome {
                error!(schedule_id = %schedule.id, error = %e, "failed to start scheduled workflow");
            } else {
                info!(schedule_id = %schedule.id, workflow = %schedule.workflow_name, "started scheduled workflow");
            }

            if let Some(existing) = self.schedules.write().unwrap().get_mut(&schedule.id) {
                existing.last_run = Some(now);
                existing.next_run = existing.expr.next(now);
            }

            results.push((schedule.id, outcome));
        }

        results
    }

    /// Run [`Self::tick`] every second until [`Self::shutdown`] is called.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            let mut shutdown_rx = self.shutdown_rx.clone();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = self.tick().await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("cron scheduler shutting down");
                        break;
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // CronScheduler itself needs a live Datastore-backed WorkflowEngine,
    // which these unit tests don't have; its datastore-gated behaviour is
    // covered by `tests/workflow_integration_test.rs` instead. Here we
    // only check the expression parsing `add_schedule` relies on.

    #[test]
    fn test_add_schedule_rejects_invalid_expr() {
        assert!(matches!(CronExpr::parse("not a cron expr"), Err(_)));
    }

    #[test]
    fn test_every_schedule_next_run_is_in_the_future() {
        let expr = CronExpr::parse("@every 5m").unwrap();
        let now = Utc::now();
        assert!(expr.next(now) > now);
    }
}
