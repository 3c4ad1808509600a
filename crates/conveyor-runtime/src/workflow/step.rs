//! The step tree: plain data describing a workflow's shape (spec §3,
//! §4.8). Handlers and predicates are referenced by name rather than
//! carried as closures, since a [`super::state::WorkflowState`] has to
//! survive a JSON round-trip and a process restart — see the
//! workspace's notes on callback-centric builder APIs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::retry::RetryPolicy;

/// A named node in a workflow's step tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
}

impl Step {
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn action(name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self::new(
            name,
            StepKind::Action(ActionStep {
                handler: handler.into(),
                input: Value::Null,
                retry_policy: RetryPolicy::none(),
                compensation: None,
            }),
        )
    }

    pub fn sleep(name: impl Into<String>, duration: Duration) -> Self {
        Self::new(name, StepKind::Sleep { duration })
    }

    pub fn checkpoint(name: impl Into<String>) -> Self {
        Self::new(name, StepKind::Checkpoint)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Action(ActionStep),
    Condition(ConditionStep),
    Loop(LoopStep),
    Parallel(ParallelStep),
    Await(AwaitStep),
    Sleep {
        #[serde(with = "duration_millis")]
        duration: Duration,
    },
    SubWorkflow(SubWorkflowStep),
    Checkpoint,
}

/// Invokes a registered handler; on success, registers `compensation`
/// (another registered handler, invoked in reverse order if a later
/// step fails) per the saga pattern in spec §4.8.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStep {
    pub handler: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub compensation: Option<String>,
}

impl ActionStep {
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_compensation(mut self, handler: impl Into<String>) -> Self {
        self.compensation = Some(handler.into());
        self
    }
}

/// `then` / `else if` chain / `else`: the first branch whose predicate
/// returns true runs; if none match, `else_` runs (may be empty).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConditionStep {
    pub branches: Vec<(String, Vec<Step>)>,
    #[serde(default)]
    pub else_: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LoopMode {
    /// Re-evaluates `condition` before each iteration; sets `_iteration`
    /// in the workflow's data map.
    While { condition: String },
    /// Iterates a JSON array read from `data[items_key]`; sets `_index`
    /// and `_item` in the data map.
    ForEach { items_key: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopStep {
    pub mode: LoopMode,
    pub max_iterations: u32,
    #[serde(default)]
    pub break_condition: Option<String>,
    pub body: Vec<Step>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    WaitAll,
    WaitAny,
    WaitCount(usize),
}

/// Executes `branches` concurrently. Zero branches completes immediately
/// with success (spec §8 boundary behaviour).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelStep {
    pub branches: Vec<Vec<Step>>,
    pub wait: WaitStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AwaitKind {
    Signal { name: String },
    Approval { name: String, approvers: Vec<String> },
}

impl AwaitKind {
    pub fn name(&self) -> &str {
        match self {
            AwaitKind::Signal { name } => name,
            AwaitKind::Approval { name, .. } => name,
        }
    }
}

/// Suspends the step tree until a matching `Signal`/`Approve`/`Reject`
/// call arrives or `timeout` elapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwaitStep {
    pub kind: AwaitKind,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    #[serde(default)]
    pub on_timeout: Option<Value>,
}

/// Executes a nested workflow to completion; its `StepResults` are
/// stored under this step's name in the parent's results map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubWorkflowStep {
    pub workflow_name: String,
    pub input: Value,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_builder() {
        let step = Step::action("charge", "charge_card").kind_as_action();
        assert_eq!(step.handler, "charge_card");
    }

    #[test]
    fn test_parallel_zero_branches_round_trips() {
        let step = Step::new(
            "fanout",
            StepKind::Parallel(ParallelStep {
                branches: vec![],
                wait: WaitStrategy::WaitAll,
            }),
        );
        let json = serde_json::to_string(&step).unwrap();
        let restored: Step = serde_json::from_str(&json).unwrap();
        match restored.kind {
            StepKind::Parallel(p) => assert!(p.branches.is_empty()),
            _ => panic!("expected parallel"),
        }
    }

    #[test]
    fn test_loop_max_iterations_zero_is_representable() {
        let step = LoopStep {
            mode: LoopMode::While {
                condition: "always_true".into(),
            },
            max_iterations: 0,
            break_condition: None,
            body: vec![],
        };
        assert_eq!(step.max_iterations, 0);
    }

    impl Step {
        fn kind_as_action(self) -> ActionStep {
            match self.kind {
                StepKind::Action(a) => a,
                _ => panic!("expected action"),
            }
        }
    }
}
