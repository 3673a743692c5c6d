//! The purpose of this module is to alleviate the need to import many of the `[rsupervisor]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use rsupervisor::prelude::*;
//! ```
pub use crate::backoff::{BackoffStrategy, Jitter};
pub use crate::circuit_breaker::CircuitState;
pub use crate::config::SupervisorConfig;
pub use crate::executor::Executor;
pub use crate::handler::{HandlerError, JobContext, TaskHandler};
pub use crate::job::builder::JobBuilder;
pub use crate::job::query::JobQuery;
pub use crate::job::{ErrorType, ExecutionError, Job, JobExecution, JobId, JobOutcome, JobStatus};
pub use crate::stats::SupervisorStats;
pub use crate::worker::{Worker, WorkerId, WorkerStatus};
pub use crate::{Supervisor, SupervisorError, SupervisorState};
