//! The execution substrate: queueing, concurrency primitives, the worker
//! pool, event stream, DLQ with alerting, delayed delivery, dependency
//! manager, workflow engine, cron scheduler, and batch processor built on
//! top of [`conveyor_core`].

pub mod batch;
pub mod concurrency;
pub mod cron;
pub mod delayed;
pub mod deps;
pub mod dlq;
pub mod events;
pub mod queue;
pub mod worker;
pub mod workflow;

/// Re-exports of the types most callers need.
pub mod prelude {
    pub use crate::batch::{BatchProcessor, ProgressTracker};
    pub use crate::concurrency::{DistributedSemaphore, Lock, RateLimiter};
    pub use crate::cron::{CronExpr, CronScheduler, Schedule};
    pub use crate::delayed::DelayedScheduler;
    pub use crate::deps::DependencyManager;
    pub use crate::dlq::{Alerter, DlqEntry, DlqSink};
    pub use crate::events::{Event, EventKind, EventStream};
    pub use crate::queue::{JobSource, PartitionedWorker, Queue, ShardStrategy, ShardedQueue};
    pub use crate::worker::{Cancellation, WorkerPool, WorkerPoolConfig};
    pub use crate::workflow::{
        RetryPolicy, Step, Workflow, WorkflowEngine, WorkflowState, WorkflowStatus,
    };
}
