//! The task handler contract and the registry keyed by job type.
//!
//! A [`TaskHandler`] receives a [`JobContext`] and the [`Job`] and returns an opaque JSON result.
//! The supervisor never looks inside the payload or the result.
//!
//! Plain async closures are handlers too:
//!
//! ```
//! # use rsupervisor::handler::{HandlerError, JobContext, TaskHandler};
//! # use rsupervisor::job::Job;
//! # use serde_json::Value;
//! fn assert_handler(_: impl TaskHandler) {}
//!
//! assert_handler(|_ctx: JobContext, job: Job| async move {
//!     Ok::<_, HandlerError>(Value::Object(job.payload))
//! });
//! ```
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    job::{Job, JobId},
    worker::WorkerId,
    SupervisorError,
};

/// The error type handlers fail with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Per execution information handed to a [`TaskHandler`].
///
/// The execution is aborted once the deadline passes or the job is cancelled. Long running
/// handlers can watch [`JobContext::cancelled`] to stop early.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    attempt: u32,
    worker_id: WorkerId,
    cancellation: CancellationToken,
    deadline: Instant,
}

impl JobContext {
    pub(crate) fn new(
        job_id: JobId,
        attempt: u32,
        worker_id: WorkerId,
        cancellation: CancellationToken,
        deadline: Instant,
    ) -> Self {
        Self {
            job_id,
            attempt,
            worker_id,
            cancellation,
            deadline,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// The 1-based number of this execution.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes once the job is cancelled or the supervisor shuts down.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

/// Executes the jobs of one type.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext, job: Job) -> Result<Value, HandlerError>;

    /// Whether the circuit breaker guards this handler.
    ///
    /// Failures of protected handlers count towards opening the breaker, and while it is open
    /// their jobs fail without running.
    fn is_protected(&self) -> bool {
        true
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(JobContext, Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext, job: Job) -> Result<Value, HandlerError> {
        (self)(ctx, job).await
    }
}

/// Handlers by job type.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn register(
        &self,
        job_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), SupervisorError> {
        let job_type = job_type.into();
        let mut handlers = self.handlers.write().map_err(|_| SupervisorError::BadState)?;
        if handlers.insert(job_type.clone(), handler).is_some() {
            tracing::warn!(%job_type, "Replaced the handler for task type {job_type}");
        }
        Ok(())
    }

    pub fn get(&self, job_type: &str) -> Result<Option<Arc<dyn TaskHandler>>, SupervisorError> {
        Ok(self
            .handlers
            .read()
            .map_err(|_| SupervisorError::BadState)?
            .get(job_type)
            .cloned())
    }

    pub fn len(&self) -> Result<usize, SupervisorError> {
        Ok(self
            .handlers
            .read()
            .map_err(|_| SupervisorError::BadState)?
            .len())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn context() -> JobContext {
        JobContext::new(
            "job".into(),
            1,
            "worker".into(),
            CancellationToken::new(),
            Instant::now() + Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn closures_are_handlers() {
        let registry = HandlerRegistry::default();
        registry
            .register(
                "echo",
                Arc::new(|_ctx: JobContext, job: Job| async move {
                    Ok::<_, HandlerError>(Value::from(job.job_type))
                }),
            )
            .unwrap();

        let handler = registry.get("echo").unwrap().unwrap();
        let result = handler.handle(context(), Job::new("job", "echo")).await;

        assert_eq!(result.unwrap(), Value::from("echo"));
        assert!(handler.is_protected());
        assert!(registry.get("other").unwrap().is_none());
    }

    #[tokio::test]
    async fn later_registrations_replace_earlier_ones() {
        let registry = HandlerRegistry::default();
        let mut first = MockTaskHandler::new();
        first.expect_handle().never();
        let mut second = MockTaskHandler::new();
        second
            .expect_handle()
            .times(1)
            .returning(|_, _| Ok(Value::Null));

        registry.register("echo", Arc::new(first)).unwrap();
        registry.register("echo", Arc::new(second)).unwrap();

        let handler = registry.get("echo").unwrap().unwrap();
        handler.handle(context(), Job::new("job", "echo")).await.unwrap();
        assert_eq!(registry.len().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn context_reports_remaining_time() {
        let ctx = context();
        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(ctx.remaining(), Duration::from_millis(600));
        assert!(!ctx.is_cancelled());
    }
}
