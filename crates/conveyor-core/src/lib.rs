//! Shared primitives for the conveyor job-and-workflow substrate:
//! the [`Job`] record, the datastore facade, configuration, and the
//! error taxonomy every other crate in the workspace builds on.

pub mod config;
pub mod error;
pub mod job;
pub mod store;

/// Re-exports of the types most callers need.
pub mod prelude {
    pub use crate::config::DatastoreConfig;
    pub use crate::error::{Error, Result};
    pub use crate::job::{Job, JobId};
    pub use crate::store::{Datastore, SetNxOutcome, StreamRecord};
}
