//! Workflow definitions as plain data, plus the in-process registry that
//! resolves the named handlers/predicates a definition's steps reference.
//!
//! Per the workspace's re-architecture notes: a definition is a
//! value-producing construction (a name, a version, an ordered `Vec<Step>`)
//! rather than a callback-centric builder. Closures can't survive a
//! [`super::state::WorkflowState`] round-trip, so handlers are named and
//! resolved here at execution time; recovering a running workflow after a
//! restart requires the same definition and the same handler names to be
//! re-registered in-process.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::step::Step;

/// Error surfaced from an action handler or compensation handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    pub message: String,
    pub code: Option<String>,
    pub retryable: bool,
}

impl WorkflowError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// A read-only snapshot of a running state, passed by value to handlers
/// and predicates so they never touch the state's guarding lock directly.
#[derive(Debug, Clone, Default)]
pub struct WorkflowView {
    pub data: Value,
    pub step_results: HashMap<String, Value>,
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// `(view, step_input) -> result`. Used for both `Action` handlers and
/// compensation handlers — a compensation is just another registered
/// action, referenced by name from `ActionStep::compensation`.
pub type ActionFn =
    Arc<dyn Fn(WorkflowView, Value) -> BoxFuture<Result<Value, WorkflowError>> + Send + Sync>;

/// `(view) -> bool`, used by `Condition` branches and `Loop` conditions.
pub type PredicateFn = Arc<dyn Fn(&WorkflowView) -> bool + Send + Sync>;

/// A named, versioned, ordered sequence of steps.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: u32,
    pub steps: Vec<Step>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, version: u32, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            version,
            steps,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown workflow definition: {0}")]
    UnknownWorkflow(String),
    #[error("unknown action handler: {0}")]
    UnknownHandler(String),
    #[error("unknown predicate: {0}")]
    UnknownPredicate(String),
}

/// Holds registered workflow definitions plus the named handler and
/// predicate functions their steps reference.
#[derive(Default)]
pub struct WorkflowRegistry {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
    handlers: HashMap<String, ActionFn>,
    predicates: HashMap<String, PredicateFn>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_workflow(&mut self, definition: WorkflowDefinition) {
        self.definitions
            .insert(definition.name.clone(), Arc::new(definition));
    }

    pub fn register_handler<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(WorkflowView, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkflowError>> + Send + 'static,
    {
        let f: ActionFn = Arc::new(move |view, input| Box::pin(handler(view, input)));
        self.handlers.insert(name.into(), f);
    }

    pub fn register_predicate<F>(&mut self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&WorkflowView) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(predicate));
    }

    pub fn definition(&self, name: &str) -> Result<Arc<WorkflowDefinition>, RegistryError> {
        self.definitions
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownWorkflow(name.to_string()))
    }

    pub fn handler(&self, name: &str) -> Result<ActionFn, RegistryError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownHandler(name.to_string()))
    }

    pub fn predicate(&self, name: &str) -> Result<PredicateFn, RegistryError> {
        self.predicates
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownPredicate(name.to_string()))
    }

    pub fn workflow_names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::step::{ActionStep, StepKind};

    #[test]
    fn test_register_and_lookup_workflow() {
        let mut registry = WorkflowRegistry::new();
        registry.register_workflow(WorkflowDefinition::new(
            "ship",
            1,
            vec![Step::new(
                "charge",
                StepKind::Action(ActionStep {
                    handler: "charge_card".into(),
                    input: Value::Null,
                    retry_policy: Default::default(),
                    compensation: None,
                }),
            )],
        ));

        assert!(registry.definition("ship").is_ok());
        assert!(matches!(
            registry.definition("missing"),
            Err(RegistryError::UnknownWorkflow(_))
        ));
    }

    #[test]
    fn test_register_and_call_handler() {
        let mut registry = WorkflowRegistry::new();
        registry.register_handler("noop", |_view, input| async move { Ok(input) });

        let handler = registry.handler("noop").expect("registered");
        let fut = handler(WorkflowView::default(), Value::String("x".into()));
        let result = futures::executor::block_on(fut).unwrap();
        assert_eq!(result, Value::String("x".into()));
    }

    #[test]
    fn test_register_and_call_predicate() {
        let mut registry = WorkflowRegistry::new();
        registry.register_predicate("always_true", |_view| true);

        let predicate = registry.predicate("always_true").unwrap();
        assert!(predicate(&WorkflowView::default()));
    }

    #[test]
    fn test_unknown_handler_is_an_error() {
        let registry = WorkflowRegistry::new();
        assert!(matches!(
            registry.handler("ghost"),
            Err(RegistryError::UnknownHandler(_))
        ));
    }
}
