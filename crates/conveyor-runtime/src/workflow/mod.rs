//! Durable workflow engine: step trees, saga-style compensation, retry
//! policies, and signal/approval suspension (spec §4.8).
//!
//! Handlers and predicates are registered by name in a
//! [`WorkflowRegistry`] rather than carried as closures inside a
//! [`WorkflowDefinition`], because a [`WorkflowState`] must survive a
//! JSON round-trip through the datastore and a process restart.

pub mod definition;
pub mod engine;
pub mod retry;
pub mod state;
pub mod step;

pub use definition::{
    ActionFn, PredicateFn, RegistryError, WorkflowDefinition as Workflow, WorkflowError,
    WorkflowRegistry, WorkflowView,
};
pub use engine::{WorkflowEngine, WorkflowEngineError};
pub use retry::RetryPolicy;
pub use state::{CompensationEntry, WorkflowState, WorkflowStatus};
pub use step::{
    ActionStep, AwaitKind, AwaitStep, ConditionStep, LoopMode, LoopStep, ParallelStep, Step,
    StepKind, SubWorkflowStep, WaitStrategy,
};
