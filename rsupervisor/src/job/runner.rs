use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::{task::JoinError, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::{
    handler::{HandlerError, JobContext, TaskHandler},
    shared::Shared,
    worker::{runner::Assignment, WorkerId},
};

use super::{ErrorType, ExecutionError, Job, JobId, JobStatus};

/// How a single attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Completed(Value),
    /// Eligible for a retry.
    Failed(ExecutionError),
    /// Eligible for a retry.
    TimedOut(Duration),
    Cancelled,
    /// The deadline had passed before the job was dispatched.
    Expired,
    /// The dispatcher had to give up on the job.
    Dropped(String),
}

impl Outcome {
    /// What the outcome says about the worker: `None` for outcomes that are not its doing.
    pub fn worker_success(&self) -> Option<bool> {
        match self {
            Self::Completed(_) => Some(true),
            Self::Failed(error) if error.error_type == ErrorType::NoHandler => None,
            Self::Failed(_) | Self::TimedOut(_) => Some(false),
            Self::Cancelled | Self::Expired | Self::Dropped(_) => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::TimedOut(_))
    }

    pub fn status(&self) -> JobStatus {
        match self {
            Self::Completed(_) => JobStatus::Completed,
            Self::Failed(_) | Self::Dropped(_) => JobStatus::Failed,
            Self::TimedOut(_) | Self::Expired => JobStatus::Timeout,
            Self::Cancelled => JobStatus::Cancelled,
        }
    }

    pub fn error(&self) -> Option<ExecutionError> {
        match self {
            Self::Completed(_) => None,
            Self::Failed(error) => Some(error.clone()),
            Self::TimedOut(timeout) => Some(ExecutionError::from(*timeout)),
            Self::Cancelled => Some(ExecutionError::new(ErrorType::Cancelled, "job cancelled")),
            Self::Expired => Some(ExecutionError::new(ErrorType::Expired, "deadline exceeded")),
            Self::Dropped(reason) => Some(ExecutionError::new(ErrorType::Dropped, reason.clone())),
        }
    }
}

/// Sent from the execution side to the result processor.
#[derive(Debug, Clone)]
pub(crate) struct ExecutionReport {
    pub job_id: JobId,
    pub worker_id: Option<WorkerId>,
    /// The attempt the report belongs to. Reports for superseded attempts are ignored.
    pub attempt: u32,
    pub outcome: Outcome,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl ExecutionReport {
    /// A report for a job that never reached a worker.
    pub fn without_worker(job: &Job, outcome: Outcome) -> Self {
        Self {
            job_id: job.id.clone(),
            worker_id: None,
            attempt: job.attempt,
            outcome,
            started_at: Utc::now(),
            duration: Duration::ZERO,
        }
    }
}

/// Runs the jobs handed to one worker.
pub(crate) struct JobRunner {
    shared: Arc<Shared>,
    worker_id: WorkerId,
}

impl JobRunner {
    pub fn new(shared: Arc<Shared>, worker_id: WorkerId) -> Self {
        Self { shared, worker_id }
    }

    #[instrument(
        skip(self, assignment),
        fields(job_id = %assignment.job.id, worker_id = %self.worker_id, attempt = assignment.attempt)
    )]
    pub async fn execute(&self, assignment: Assignment) -> ExecutionReport {
        let Assignment {
            job,
            attempt,
            timeout,
            cancellation,
        } = assignment;
        let job_id = job.id.clone();
        let started_at = Utc::now();
        let started = Instant::now();

        let outcome = match self.shared.handlers.get(&job.job_type) {
            Ok(Some(handler)) => {
                self.run_handler(handler, job, attempt, timeout, cancellation)
                    .await
            }
            Ok(None) => Outcome::Failed(ExecutionError::new(
                ErrorType::NoHandler,
                format!("no handler registered for task type: {}", job.job_type),
            )),
            Err(err) => Outcome::Failed(ExecutionError::new(ErrorType::Handler, err.to_string())),
        };

        ExecutionReport {
            job_id,
            worker_id: Some(self.worker_id.clone()),
            attempt,
            outcome,
            started_at,
            duration: started.elapsed(),
        }
    }

    async fn run_handler(
        &self,
        handler: Arc<dyn TaskHandler>,
        job: Job,
        attempt: u32,
        timeout: Duration,
        cancellation: CancellationToken,
    ) -> Outcome {
        let job_id = job.id.clone();
        if cancellation.is_cancelled() {
            tracing::debug!(%job_id, "Job {job_id} was cancelled before it started");
            return Outcome::Cancelled;
        }
        let protected = handler.is_protected();
        let ctx = JobContext::new(
            job_id.clone(),
            attempt,
            self.worker_id.clone(),
            cancellation.clone(),
            Instant::now() + timeout,
        );

        tracing::debug!(%job_id, "Executing job {job_id}");
        let mut task = tokio::spawn(
            async move { handler.handle(ctx, job).await }.in_current_span(),
        );

        let outcome = tokio::select! {
            joined = &mut task => match joined {
                Ok(Ok(value)) => Outcome::Completed(value),
                Ok(Err(error)) => Outcome::Failed(error.into()),
                Err(error) => Outcome::Failed(error.into()),
            },
            _ = tokio::time::sleep(timeout) => {
                task.abort();
                Outcome::TimedOut(timeout)
            },
            _ = cancellation.cancelled() => {
                task.abort();
                Outcome::Cancelled
            },
        };

        if protected {
            self.record_protected_outcome(&job_id, &outcome);
        }
        outcome
    }

    fn record_protected_outcome(&self, job_id: &JobId, outcome: &Outcome) {
        let Some(breaker) = &self.shared.breaker else {
            return;
        };
        let recorded = match outcome {
            Outcome::Completed(_) => breaker.record_success(),
            Outcome::Failed(_) | Outcome::TimedOut(_) => breaker.record_failure(),
            Outcome::Cancelled | Outcome::Expired | Outcome::Dropped(_) => Ok(()),
        };
        let _ = recorded.inspect_err(|err| {
            tracing::error!(
                ?err,
                %job_id,
                "Failed to record the outcome of job {job_id} with the circuit breaker: {err}"
            )
        });
    }
}

impl From<JoinError> for ExecutionError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self::new(ErrorType::Panic, message)
    }
}

impl From<HandlerError> for ExecutionError {
    fn from(value: HandlerError) -> Self {
        Self::new(ErrorType::Handler, value.to_string())
    }
}

impl From<Duration> for ExecutionError {
    fn from(value: Duration) -> Self {
        Self::new(
            ErrorType::Timeout,
            format!("job failed to complete within timeout: {value:?}"),
        )
    }
}
