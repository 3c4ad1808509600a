//! The workflow interpreter: walks a [`WorkflowDefinition`]'s step tree,
//! persisting [`WorkflowState`] after every top-level transition so a run
//! can resume after a process restart (spec §4.8, §3).
//!
//! `start` launches the walk as a detached `tokio::spawn`'d task; the
//! caller gets the state ID back immediately and polls/queries status,
//! signals, or approvals independently. This mirrors the worker pool's
//! spawn-and-track-handles shape in [`crate::worker`].

use std::sync::Arc;
use std::time::Duration;

use conveyor_core::error::Error as CoreError;
use conveyor_core::store::Datastore;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::definition::{WorkflowDefinition, WorkflowError, WorkflowRegistry, WorkflowView};
use super::state::{CompensationEntry, WorkflowState, WorkflowStatus};
use super::step::{
    ActionStep, AwaitKind, AwaitStep, ConditionStep, LoopMode, LoopStep, ParallelStep, Step,
    StepKind, SubWorkflowStep, WaitStrategy,
};

const STATE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const PENDING_SIGNALS_KEY: &str = "__pending_signals";

#[derive(Debug, thiserror::Error)]
pub enum WorkflowEngineError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Registry(#[from] super::definition::RegistryError),
    #[error("workflow state {0} not found")]
    StateNotFound(String),
    #[error("corrupt workflow state: {0}")]
    CorruptState(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WorkflowEngineError>;

/// Outcome of executing one step (or step subtree).
enum StepOutcome {
    Completed,
    Failed(WorkflowError),
}

/// Interprets workflow definitions against a shared [`WorkflowRegistry`],
/// persisting state through a [`Datastore`].
#[derive(Clone)]
pub struct WorkflowEngine {
    datastore: Datastore,
    registry: Arc<WorkflowRegistry>,
    waiters: Arc<DashMap<String, oneshot::Sender<Value>>>,
    pause_requests: Arc<DashMap<String, ()>>,
}

impl WorkflowEngine {
    pub fn new(datastore: Datastore, registry: Arc<WorkflowRegistry>) -> Self {
        Self {
            datastore,
            registry,
            waiters: Arc::new(DashMap::new()),
            pause_requests: Arc::new(DashMap::new()),
        }
    }

    fn state_key(&self, state_id: &str) -> String {
        self.datastore.key(&format!("workflow:{state_id}"))
    }

    async fn save_state(&self, state: &WorkflowState) -> Result<()> {
        let json = state.to_json()?;
        self.datastore
            .set_with_ttl(&self.state_key(&state.state_id), &json, STATE_TTL)
            .await?;
        Ok(())
    }

    pub async fn load_state(&self, state_id: &str) -> Result<WorkflowState> {
        let raw = self
            .datastore
            .get(&self.state_key(state_id))
            .await?
            .ok_or_else(|| WorkflowEngineError::StateNotFound(state_id.to_string()))?;
        Ok(WorkflowState::from_json(&raw)?)
    }

    /// Start a new run of `workflow_name` with `input`, returning its
    /// freshly-minted state ID. Execution proceeds on a detached task.
    #[instrument(skip(self, input), fields(workflow_name = %workflow_name))]
    pub async fn start(&self, workflow_name: &str, input: Value) -> Result<String> {
        let definition = self.registry.definition(workflow_name)?;
        let state_id = Uuid::new_v4().to_string();
        let state = WorkflowState::new(&state_id, workflow_name, input);
        self.save_state(&state).await?;

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_from(definition, state).await;
        });

        Ok(state_id)
    }

    /// Re-enter a persisted run (after a `pause`, or after a process
    /// restart found it `AwaitingSignal`/`AwaitingApproval`/`Paused`).
    ///
    /// Resume re-enters at the top-level step index it stopped on; any
    /// nested `Action` steps inside that compound step (a `Condition`,
    /// `Loop`, or `Parallel` body) re-run from the top of that step. This
    /// is a documented limitation: nested actions must be safe to run
    /// more than once if a run is resumed mid-compound-step.
    #[instrument(skip(self), fields(state_id = %state_id))]
    pub async fn resume(&self, state_id: &str) -> Result<()> {
        let state = self.load_state(state_id).await?;
        if state.status.is_terminal() {
            return Ok(());
        }
        self.pause_requests.remove(state_id);
        let definition = self.registry.definition(&state.workflow_name)?;

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_from(definition, state).await;
        });
        Ok(())
    }

    pub async fn status(&self, state_id: &str) -> Result<WorkflowStatus> {
        Ok(self.load_state(state_id).await?.status)
    }

    /// Request a cooperative pause: the run stops before its next
    /// top-level step and persists as `Paused`. Call [`Self::resume`] to
    /// continue.
    pub fn pause(&self, state_id: &str) {
        self.pause_requests.insert(state_id.to_string(), ());
    }

    fn waiter_key(state_id: &str, await_name: &str) -> String {
        format!("{state_id}:{await_name}")
    }

    /// Deliver a named signal. If a live in-process waiter exists it is
    /// woken directly; otherwise the payload is recorded on the persisted
    /// state (under a reserved key) for a suspended or not-yet-running
    /// waiter to pick up, and the run is poked to resume.
    pub async fn signal(&self, state_id: &str, name: &str, payload: Value) -> Result<()> {
        self.deliver(state_id, name, payload).await
    }

    pub async fn approve(&self, state_id: &str, name: &str, approver: &str) -> Result<()> {
        self.deliver(
            state_id,
            name,
            serde_json::json!({"approved": true, "approver": approver}),
        )
        .await
    }

    pub async fn reject(&self, state_id: &str, name: &str, approver: &str) -> Result<()> {
        self.deliver(
            state_id,
            name,
            serde_json::json!({"approved": false, "approver": approver}),
        )
        .await
    }

    async fn deliver(&self, state_id: &str, name: &str, payload: Value) -> Result<()> {
        let key = Self::waiter_key(state_id, name);
        if let Some((_, tx)) = self.waiters.remove(&key) {
            let _ = tx.send(payload);
            return Ok(());
        }

        let mut state = self.load_state(state_id).await?;
        let pending = state
            .data
            .as_object_mut()
            .and_then(|obj| {
                obj.entry(PENDING_SIGNALS_KEY)
                    .or_insert_with(|| Value::Object(Default::default()))
                    .as_object_mut()
            });
        if let Some(pending) = pending {
            pending.insert(name.to_string(), payload);
        }
        self.save_state(&state).await?;

        if !state.status.is_terminal() {
            self.resume(state_id).await?;
        }
        Ok(())
    }

    fn take_pending_signal(state: &mut WorkflowState, name: &str) -> Option<Value> {
        state
            .data
            .as_object_mut()
            .and_then(|obj| obj.get_mut(PENDING_SIGNALS_KEY))
            .and_then(|pending| pending.as_object_mut())
            .and_then(|pending| pending.remove(name))
    }

    #[instrument(skip(self, definition, state), fields(state_id = %state.state_id, workflow = %state.workflow_name))]
    async fn run_from(&self, definition: Arc<WorkflowDefinition>, mut state: WorkflowState) {
        if state.started_at.is_none() {
            state.started_at = Some(chrono::Utc::now());
        }
        state.status = WorkflowStatus::Running;
        if let Err(e) = self.save_state(&state).await {
            warn!(error = %e, "failed to persist workflow state");
            return;
        }

        while state.current_step < definition.steps.len() {
            if self.pause_requests.contains_key(&state.state_id) {
                state.status = WorkflowStatus::Paused;
                let _ = self.save_state(&state).await;
                return;
            }

            let step = definition.steps[state.current_step].clone();
            let step_name = step.name.clone();
            let state_mutex = Arc::new(parking_lot::Mutex::new(state));
            let outcome = self.exec_step(&definition, &state_mutex, step).await;
            state = Arc::try_unwrap(state_mutex)
                .map(|mutex| mutex.into_inner())
                .unwrap_or_else(|arc| arc.lock().clone());

            match outcome {
                StepOutcome::Completed => {
                    state.current_step += 1;
                    if let Err(e) = self.save_state(&state).await {
                        warn!(error = %e, step = %step_name, "failed to persist workflow state");
                        return;
                    }
                }
                StepOutcome::Failed(err) => {
                    state.record_error(&step_name, &err.message);
                    state.status = WorkflowStatus::Compensating;
                    let _ = self.save_state(&state).await;
                    self.run_compensations(&mut state).await;
                    state.status = WorkflowStatus::Failed;
                    state.completed_at = Some(chrono::Utc::now());
                    let _ = self.save_state(&state).await;
                    return;
                }
            }
        }

        state.status = WorkflowStatus::Completed;
        state.completed_at = Some(chrono::Utc::now());
        let _ = self.save_state(&state).await;
        info!(state_id = %state.state_id, "workflow completed");
    }

    async fn run_compensations(&self, state: &mut WorkflowState) {
        let entries: Vec<CompensationEntry> = state.compensations.drain(..).rev().collect();
        for entry in entries {
            let Ok(handler) = self.registry.handler(&entry.handler) else {
                state.record_error(&entry.step_name, "compensation handler not registered");
                continue;
            };
            let view = WorkflowView {
                data: state.data.clone(),
                step_results: state.step_results.clone(),
            };
            let input = state
                .step_results
                .get(&entry.step_name)
                .cloned()
                .unwrap_or(Value::Null);
            if let Err(err) = handler(view, input).await {
                state.record_error(&entry.step_name, &format!("compensation failed: {}", err.message));
            }
        }
    }

    fn exec_step<'a>(
        &'a self,
        definition: &'a Arc<WorkflowDefinition>,
        state: &'a Arc<parking_lot::Mutex<WorkflowState>>,
        step: Step,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = StepOutcome> + Send + 'a>> {
        Box::pin(async move {
            match step.kind {
                StepKind::Action(action) => self.exec_action(state, &step.name, action).await,
                StepKind::Condition(cond) => self.exec_condition(definition, state, cond).await,
                StepKind::Loop(loop_step) => self.exec_loop(definition, state, loop_step).await,
                StepKind::Parallel(parallel) => {
                    self.exec_parallel(definition, state, parallel).await
                }
                StepKind::Await(await_step) => {
                    self.exec_await(state, &step.name, await_step).await
                }
                StepKind::Sleep { duration } => {
                    tokio::time::sleep(duration).await;
                    StepOutcome::Completed
                }
                StepKind::SubWorkflow(sub) => {
                    self.exec_sub_workflow(state, &step.name, sub).await
                }
                StepKind::Checkpoint => {
                    let mut guard = state.lock();
                    let idx = guard.current_step;
                    guard.checkpoints.insert(step.name.clone(), idx);
                    StepOutcome::Completed
                }
            }
        })
    }

    fn view_of(state: &Arc<parking_lot::Mutex<WorkflowState>>) -> WorkflowView {
        let guard = state.lock();
        WorkflowView {
            data: guard.data.clone(),
            step_results: guard.step_results.clone(),
        }
    }

    async fn exec_action(
        &self,
        state: &Arc<parking_lot::Mutex<WorkflowState>>,
        step_name: &str,
        action: ActionStep,
    ) -> StepOutcome {
        let handler = match self.registry.handler(&action.handler) {
            Ok(h) => h,
            Err(e) => return StepOutcome::Failed(WorkflowError::new(e.to_string())),
        };

        let mut attempt: u32 = 1;
        loop {
            let view = Self::view_of(state);
            let result = handler(view, action.input.clone()).await;

            match result {
                Ok(value) => {
                    let mut guard = state.lock();
                    guard.step_results.insert(step_name.to_string(), value);
                    if let Some(compensation) = &action.compensation {
                        guard.compensations.push(CompensationEntry {
                            step_name: step_name.to_string(),
                            handler: compensation.clone(),
                        });
                    }
                    return StepOutcome::Completed;
                }
                Err(err) => {
                    let should_retry = action.retry_policy.should_retry(err.retryable, err.code.as_deref())
                        && action.retry_policy.has_attempts_remaining(attempt);
                    if !should_retry {
                        return StepOutcome::Failed(err);
                    }
                    let delay = action.retry_policy.delay_for_attempt(attempt + 1);
                    if delay > Duration::ZERO {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn exec_steps_seq(
        &self,
        definition: &Arc<WorkflowDefinition>,
        state: &Arc<parking_lot::Mutex<WorkflowState>>,
        steps: Vec<Step>,
    ) -> StepOutcome {
        for step in steps {
            match self.exec_step(definition, state, step).await {
                StepOutcome::Completed => continue,
                failed => return failed,
            }
        }
        StepOutcome::Completed
    }

    async fn exec_condition(
        &self,
        definition: &Arc<WorkflowDefinition>,
        state: &Arc<parking_lot::Mutex<WorkflowState>>,
        cond: ConditionStep,
    ) -> StepOutcome {
        let view = Self::view_of(state);
        for (predicate_name, body) in cond.branches {
            let predicate = match self.registry.predicate(&predicate_name) {
                Ok(p) => p,
                Err(e) => return StepOutcome::Failed(WorkflowError::new(e.to_string())),
            };
            if predicate(&view) {
                return self.exec_steps_seq(definition, state, body).await;
            }
        }
        self.exec_steps_seq(definition, state, cond.else_).await
    }

    async fn exec_loop(
        &self,
        definition: &Arc<WorkflowDefinition>,
        state: &Arc<parking_lot::Mutex<WorkflowState>>,
        loop_step: LoopStep,
    ) -> StepOutcome {
        if loop_step.max_iterations == 0 {
            return StepOutcome::Completed;
        }

        let break_predicate = match &loop_step.break_condition {
            Some(name) => match self.registry.predicate(name) {
                Ok(p) => Some(p),
                Err(e) => return StepOutcome::Failed(WorkflowError::new(e.to_string())),
            },
            None => None,
        };

        match loop_step.mode {
            LoopMode::While { condition } => {
                let predicate = match self.registry.predicate(&condition) {
                    Ok(p) => p,
                    Err(e) => return StepOutcome::Failed(WorkflowError::new(e.to_string())),
                };
                for iteration in 0..loop_step.max_iterations {
                    {
                        let mut guard = state.lock();
                        set_data_field(&mut guard.data, "_iteration", serde_json::json!(iteration));
                    }
                    if !predicate(&Self::view_of(state)) {
                        break;
                    }
                    match self.exec_steps_seq(definition, state, loop_step.body.clone()).await {
                        StepOutcome::Completed => {}
                        failed => return failed,
                    }
                    if let Some(predicate) = &break_predicate {
                        if predicate(&Self::view_of(state)) {
                            break;
                        }
                    }
                }
            }
            LoopMode::ForEach { items_key } => {
                let items = {
                    let guard = state.lock();
                    guard
                        .data
                        .get(&items_key)
                        .and_then(|v| v.as_array())
                        .cloned()
                        .unwrap_or_default()
                };
                for (index, item) in items.into_iter().enumerate() {
                    if index as u32 >= loop_step.max_iterations {
                        break;
                    }
                    {
                        let mut guard = state.lock();
                        set_data_field(&mut guard.data, "_index", serde_json::json!(index));
                        set_data_field(&mut guard.data, "_item", item);
                    }
                    match self.exec_steps_seq(definition, state, loop_step.body.clone()).await {
                        StepOutcome::Completed => {}
                        failed => return failed,
                    }
                    if let Some(predicate) = &break_predicate {
                        if predicate(&Self::view_of(state)) {
                            break;
                        }
                    }
                }
            }
        }

        StepOutcome::Completed
    }

    async fn exec_parallel(
        &self,
        definition: &Arc<WorkflowDefinition>,
        state: &Arc<parking_lot::Mutex<WorkflowState>>,
        parallel: ParallelStep,
    ) -> StepOutcome {
        if parallel.branches.is_empty() {
            return StepOutcome::Completed;
        }

        let needed = match parallel.wait {
            WaitStrategy::WaitAll => parallel.branches.len(),
            WaitStrategy::WaitAny => 1,
            WaitStrategy::WaitCount(n) => n.min(parallel.branches.len()).max(1),
        };

        let mut handles = Vec::with_capacity(parallel.branches.len());
        for branch in parallel.branches {
            let engine = self.clone();
            let definition = Arc::clone(definition);
            let state = Arc::clone(state);
            handles.push(tokio::spawn(async move {
                engine.exec_steps_seq(&definition, &state, branch).await
            }));
        }

        let mut completed = 0usize;
        let mut first_error: Option<WorkflowError> = None;
        let mut remaining = handles;

        while !remaining.is_empty() && completed < needed {
            let (result, _index, rest) = futures::future::select_all(remaining).await;
            remaining = rest;
            match result {
                Ok(StepOutcome::Completed) => completed += 1,
                Ok(StepOutcome::Failed(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error = Some(WorkflowError::new(format!("branch panicked: {join_err}")));
                    }
                }
            }
        }

        for handle in remaining {
            handle.abort();
        }

        if completed >= needed {
            StepOutcome::Completed
        } else {
            StepOutcome::Failed(
                first_error.unwrap_or_else(|| WorkflowError::new("parallel step failed")),
            )
        }
    }

    async fn exec_await(
        &self,
        state: &Arc<parking_lot::Mutex<WorkflowState>>,
        step_name: &str,
        await_step: AwaitStep,
    ) -> StepOutcome {
        let await_name = await_step.kind.name().to_string();
        let state_id = state.lock().state_id.clone();

        let pending = {
            let mut guard = state.lock();
            guard.status = match &await_step.kind {
                AwaitKind::Signal { .. } => WorkflowStatus::AwaitingSignal,
                AwaitKind::Approval { .. } => WorkflowStatus::AwaitingApproval,
            };
            Self::take_pending_signal(&mut guard, &await_name)
        };

        let payload = if let Some(pending) = pending {
            Some(pending)
        } else {
            let snapshot = state.lock().clone();
            if let Err(e) = self.save_state(&snapshot).await {
                warn!(error = %e, state_id = %state_id, "failed to persist awaiting status before suspend");
            }

            let key = Self::waiter_key(&state_id, &await_name);
            let (tx, rx) = oneshot::channel();
            self.waiters.insert(key.clone(), tx);

            let result = tokio::time::timeout(await_step.timeout, rx).await;
            self.waiters.remove(&key);

            match result {
                Ok(Ok(payload)) => Some(payload),
                Ok(Err(_)) => None,
                Err(_elapsed) => None,
            }
        };

        let snapshot = {
            let mut guard = state.lock();
            guard.status = WorkflowStatus::Running;
            guard.clone()
        };
        if let Err(e) = self.save_state(&snapshot).await {
            warn!(error = %e, state_id = %state_id, "failed to persist running status after await resolved");
        }

        match payload {
            Some(payload) => {
                if let AwaitKind::Approval { .. } = &await_step.kind {
                    let approved = payload.get("approved").and_then(|v| v.as_bool()).unwrap_or(false);
                    if !approved {
                        return StepOutcome::Failed(WorkflowError::new(format!(
                            "approval '{await_name}' was rejected"
                        )));
                    }
                }
                state.lock().step_results.insert(step_name.to_string(), payload);
                StepOutcome::Completed
            }
            None => match await_step.on_timeout {
                Some(value) => {
                    state.lock().step_results.insert(step_name.to_string(), value);
                    StepOutcome::Completed
                }
                None => StepOutcome::Failed(WorkflowError::new(format!(
                    "await '{await_name}' timed out"
                ))),
            },
        }
    }

    async fn exec_sub_workflow(
        &self,
        state: &Arc<parking_lot::Mutex<WorkflowState>>,
        step_name: &str,
        sub: SubWorkflowStep,
    ) -> StepOutcome {
        let definition = match self.registry.definition(&sub.workflow_name) {
            Ok(d) => d,
            Err(e) => return StepOutcome::Failed(WorkflowError::new(e.to_string())),
        };

        let parent_id = state.lock().state_id.clone();
        let child_id = format!("{parent_id}:{}", Uuid::new_v4());
        let mut child_state = WorkflowState::new(&child_id, &sub.workflow_name, sub.input)
            .with_parent(parent_id);
        child_state.started_at = Some(chrono::Utc::now());
        child_state.status = WorkflowStatus::Running;

        if let Err(e) = self.save_state(&child_state).await {
            return StepOutcome::Failed(WorkflowError::new(e.to_string()));
        }

        while child_state.current_step < definition.steps.len() {
            let step = definition.steps[child_state.current_step].clone();
            let child_mutex = Arc::new(parking_lot::Mutex::new(child_state));
            let outcome = self.exec_step(&definition, &child_mutex, step).await;
            child_state = Arc::try_unwrap(child_mutex)
                .map(|mutex| mutex.into_inner())
                .unwrap_or_else(|arc| arc.lock().clone());

            match outcome {
                StepOutcome::Completed => child_state.current_step += 1,
                StepOutcome::Failed(err) => {
                    self.run_compensations(&mut child_state).await;
                    child_state.status = WorkflowStatus::Failed;
                    child_state.completed_at = Some(chrono::Utc::now());
                    let _ = self.save_state(&child_state).await;
                    return StepOutcome::Failed(err);
                }
            }
        }

        child_state.status = WorkflowStatus::Completed;
        child_state.completed_at = Some(chrono::Utc::now());
        let results = serde_json::to_value(&child_state.step_results).unwrap_or(Value::Null);
        let _ = self.save_state(&child_state).await;

        state.lock().step_results.insert(step_name.to_string(), results);
        StepOutcome::Completed
    }
}

fn set_data_field(data: &mut Value, key: &str, value: Value) {
    if !data.is_object() {
        *data = Value::Object(Default::default());
    }
    if let Some(obj) = data.as_object_mut() {
        obj.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::step::{AwaitKind, LoopMode};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn noop_registry() -> WorkflowRegistry {
        WorkflowRegistry::new()
    }

    #[test]
    fn test_waiter_key_format() {
        assert_eq!(WorkflowEngine::waiter_key("s1", "approve_refund"), "s1:approve_refund");
    }

    #[test]
    fn test_take_pending_signal_roundtrip() {
        let mut state = WorkflowState::new("s1", "wf", json!({}));
        let obj = state.data.as_object_mut().unwrap();
        obj.insert(
            PENDING_SIGNALS_KEY.to_string(),
            json!({"go": {"approved": true}}),
        );
        let payload = WorkflowEngine::take_pending_signal(&mut state, "go");
        assert_eq!(payload, Some(json!({"approved": true})));
        assert_eq!(WorkflowEngine::take_pending_signal(&mut state, "go"), None);
    }

    #[test]
    fn test_loop_max_iterations_zero_never_runs_body() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);
        let mut registry = noop_registry();
        registry.register_handler("bump", move |_view, _input| {
            let counter = Arc::clone(&counter_clone);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
        let loop_step = LoopStep {
            mode: LoopMode::While {
                condition: "always".into(),
            },
            max_iterations: 0,
            break_condition: None,
            body: vec![Step::action("bump_it", "bump")],
        };
        assert_eq!(loop_step.max_iterations, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_await_kind_name_used_as_waiter_key_component() {
        let kind = AwaitKind::Approval {
            name: "ship_approval".into(),
            approvers: vec!["ops".into()],
        };
        assert_eq!(kind.name(), "ship_approval");
    }
}
