//! The mutable execution record of one workflow run (spec §3's
//! "Workflow State"), persisted at `workflow:<stateID>` with a 7-day TTL
//! after every step.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `Status` transitions: Pending -> Running -> (Paused | AwaitingSignal |
/// AwaitingApproval | Compensating)* -> Completed | Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    AwaitingSignal,
    AwaitingApproval,
    Compensating,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

/// A compensation handler registered by a successful `Action` step,
/// recorded in completion order so a later failure can unwind it in
/// reverse (spec §4.8's saga compensation; ordering also resolves the
/// "partial Parallel success" open question — only steps that actually
/// completed appear here, in the order they completed).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompensationEntry {
    pub step_name: String,
    pub handler: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub state_id: String,
    pub workflow_name: String,
    pub current_step: usize,
    pub status: WorkflowStatus,
    pub data: Value,
    pub step_results: HashMap<String, Value>,
    pub checkpoints: HashMap<String, usize>,
    pub errors: Vec<String>,
    pub compensations: Vec<CompensationEntry>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Parent state ID, set only for sub-workflow runs (spec §4.8's
    /// SubWorkflow step derives a child ID from the parent).
    #[serde(default)]
    pub parent_state_id: Option<String>,
}

impl WorkflowState {
    pub fn new(state_id: impl Into<String>, workflow_name: impl Into<String>, input: Value) -> Self {
        Self {
            state_id: state_id.into(),
            workflow_name: workflow_name.into(),
            current_step: 0,
            status: WorkflowStatus::Pending,
            data: input,
            step_results: HashMap::new(),
            checkpoints: HashMap::new(),
            errors: Vec::new(),
            compensations: Vec::new(),
            started_at: None,
            completed_at: None,
            parent_state_id: None,
        }
    }

    pub fn with_parent(mut self, parent_state_id: impl Into<String>) -> Self {
        self.parent_state_id = Some(parent_state_id.into());
        self
    }

    pub fn record_error(&mut self, step_name: &str, message: &str) {
        self.errors.push(format!("{step_name}: {message}"));
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_state_defaults() {
        let state = WorkflowState::new("s1", "ship_order", json!({"order_id": 1}));
        assert_eq!(state.status, WorkflowStatus::Pending);
        assert_eq!(state.current_step, 0);
        assert!(state.step_results.is_empty());
        assert!(state.compensations.is_empty());
    }

    #[test]
    fn test_round_trip_json() {
        let mut state = WorkflowState::new("s1", "ship_order", json!({}));
        state.step_results.insert("charge".into(), json!({"ok": true}));
        state.compensations.push(CompensationEntry {
            step_name: "charge".into(),
            handler: "refund".into(),
        });
        state.record_error("notify", "smtp timeout");

        let json_str = state.to_json().unwrap();
        let restored = WorkflowState::from_json(&json_str).unwrap();

        assert_eq!(restored.step_results.get("charge"), Some(&json!({"ok": true})));
        assert_eq!(restored.compensations.len(), 1);
        assert_eq!(restored.errors, vec!["notify: smtp timeout".to_string()]);
    }

    #[test]
    fn test_is_terminal() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::AwaitingSignal.is_terminal());
    }
}
