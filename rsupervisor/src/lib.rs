//! An in-process job supervisor.
//!
//! A [`Supervisor`] accepts jobs, matches each one to the best scoring idle worker able to serve
//! its type and runs it through the [`handler::TaskHandler`] registered for that type. Failed and
//! timed out attempts are retried with backoff, a shared circuit breaker fails jobs fast while a
//! dependency is unhealthy, silent workers are detected and their jobs reassigned, and the pool
//! grows and shrinks with the load.
//!
//! # Example
//!
//! ```
//! # use rsupervisor::prelude::*;
//! # use std::time::Duration;
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let supervisor = Supervisor::new(SupervisorConfig::default().with_workers(2, 4)).unwrap();
//! supervisor
//!     .register_handler("echo", |_ctx: JobContext, job: Job| async move {
//!         Ok::<_, HandlerError>(serde_json::Value::Object(job.payload))
//!     })
//!     .unwrap();
//! supervisor.start().unwrap();
//!
//! let job_id = JobBuilder::new("echo")
//!     .with_field("message", "hello")
//!     .submit(&supervisor)
//!     .unwrap();
//! let job = rsupervisor::testing::wait_for_job(&supervisor, &job_id, Duration::from_secs(5)).await;
//! assert_eq!(job.status, JobStatus::Completed);
//!
//! supervisor.stop(Duration::from_secs(5)).await.unwrap();
//! # });
//! ```
use std::{
    collections::HashMap,
    fmt::Display,
    sync::{Arc, Mutex},
    time::Duration,
};

use autoscaler::AutoScaler;
use backoff::BackoffStrategy;
use dispatcher::Dispatcher;
use executor::{Executor, ExecutorHandler};
use futures::Stream;
use handler::TaskHandler;
use health::HealthChecker;
use job::{
    query::JobQuery, runner::ExecutionReport, Job, JobExecution, JobId, JobOutcome, JobStatus,
};
use results::ResultProcessor;
use serde::{Deserialize, Serialize};
use shared::Shared;
use stats::SupervisorStats;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use worker::{Worker, WorkerId, GENERAL_CAPABILITY};

pub mod backoff;
pub mod circuit_breaker;
pub mod config;
pub mod executor;
pub mod handler;
pub mod job;
pub mod prelude;
pub mod stats;
pub mod testing;
pub mod worker;

mod autoscaler;
mod dispatcher;
mod health;
mod results;
mod shared;

pub use config::SupervisorConfig;

/// The observable state of a [`Supervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// Not started, or stopped.
    Inactive,
    Active,
    Degraded,
    /// Shutting down.
    Maintenance,
    Error,
}

impl SupervisorState {
    /// Whether the background loops are running and the state follows the health score.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Active | Self::Degraded | Self::Error)
    }

    pub(crate) fn from_health(score: f64) -> Self {
        if score >= 0.6 {
            Self::Active
        } else if score >= 0.3 {
            Self::Degraded
        } else {
            Self::Error
        }
    }
}

impl Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Maintenance => "maintenance",
            Self::Error => "error",
        };
        f.write_str(state)
    }
}

type Receivers = (mpsc::Receiver<JobId>, mpsc::Receiver<ExecutionReport>);

/// The handle to a running job supervisor.
///
/// Dropping the handle cancels all background work. Use [`Supervisor::stop`] to wait for it to
/// wind down.
pub struct Supervisor {
    shared: Arc<Shared>,
    receivers: Mutex<Option<Receivers>>,
}

impl Supervisor {
    /// Create a supervisor. Nothing runs until [`Supervisor::start`] is called.
    pub fn new(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        config.validate().inspect_err(|err| {
            tracing::error!(?err, "Invalid supervisor configuration: {err}")
        })?;
        let (shared, queue, results) = Shared::new(config);
        Ok(Self {
            shared: Arc::new(shared),
            receivers: Mutex::new(Some((queue, results))),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.shared.config
    }

    /// Replace the retry backoff, `linear(retry_backoff)` by default.
    pub fn set_retry_backoff(&self, strategy: BackoffStrategy) -> Result<(), SupervisorError> {
        self.shared.set_backoff(strategy)
    }

    /// Register the handler for a job type, replacing any earlier one.
    pub fn register_handler(
        &self,
        job_type: impl Into<String>,
        handler: impl TaskHandler + 'static,
    ) -> Result<(), SupervisorError> {
        self.shared.handlers.register(job_type, Arc::new(handler))
    }

    /// Register a typed executor under [`Executor::NAME`].
    pub fn register_executor<E: Executor>(&self, executor: E) -> Result<(), SupervisorError> {
        self.shared
            .handlers
            .register(E::NAME, Arc::new(ExecutorHandler(executor)))
    }

    /// Start the background loops and top the pool up to `min_workers`.
    ///
    /// Must be called from within a tokio runtime. A supervisor can only be started once.
    pub fn start(&self) -> Result<(), SupervisorError> {
        let shared = &self.shared;
        if shared.cancellation.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }
        let (queue, results) = self
            .receivers
            .lock()
            .map_err(|_| SupervisorError::BadState)?
            .take()
            .ok_or(SupervisorError::AlreadyRunning)?;

        let missing = shared
            .config
            .min_workers
            .saturating_sub(shared.workers.len()?);
        for _ in 0..missing {
            shared.spawn_worker(None, [GENERAL_CAPABILITY], HashMap::new())?;
        }

        Dispatcher::new(shared.clone(), queue).spawn();
        ResultProcessor::new(shared.clone(), results).spawn();
        HealthChecker::new(shared.clone()).spawn();
        if shared.config.enable_auto_scaling {
            AutoScaler::new(shared.clone()).spawn();
        }
        shared.set_state(SupervisorState::Active)?;

        let workers = shared.workers.len()?;
        tracing::info!(workers, "Supervisor started with {workers} workers");
        Ok(())
    }

    /// Stop all background work and wait up to `timeout` for it to finish.
    ///
    /// Running jobs are aborted. Past the timeout the supervisor is left inactive and
    /// [`SupervisorError::ShutdownTimeout`] is returned; whatever is still running has already
    /// been told to stop.
    pub async fn stop(&self, timeout: Duration) -> Result<(), SupervisorError> {
        let shared = &self.shared;
        if !shared.state()?.is_running() {
            return Err(SupervisorError::NotRunning);
        }
        shared.set_state(SupervisorState::Maintenance)?;
        tracing::info!("Stopping supervisor");

        shared.cancellation.cancel();
        shared.tracker.close();
        let stopped = tokio::time::timeout(timeout, shared.tracker.wait()).await;
        shared.set_state(SupervisorState::Inactive)?;

        match stopped {
            Ok(()) => {
                tracing::info!("Supervisor stopped");
                Ok(())
            }
            Err(_) => {
                let remaining = shared.tracker.len();
                tracing::warn!(
                    remaining,
                    "Supervisor did not stop within {timeout:?}, abandoning {remaining} tasks"
                );
                Err(SupervisorError::ShutdownTimeout(timeout))
            }
        }
    }

    /// Add a manually provisioned worker with a generated id.
    pub fn add_worker(
        &self,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<WorkerId, SupervisorError> {
        self.spawn_manual_worker(None, capabilities)
    }

    pub fn add_worker_with_id(
        &self,
        worker_id: impl Into<WorkerId>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<WorkerId, SupervisorError> {
        self.spawn_manual_worker(Some(worker_id.into()), capabilities)
    }

    fn spawn_manual_worker(
        &self,
        worker_id: Option<WorkerId>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<WorkerId, SupervisorError> {
        let worker_id = self
            .shared
            .spawn_worker(worker_id, capabilities, HashMap::new())
            .inspect_err(|err| tracing::warn!(?err, "Failed to add worker: {err}"))?;
        tracing::info!(%worker_id, "Added worker {worker_id}");
        Ok(worker_id)
    }

    /// Remove a worker that is not running a job.
    pub fn remove_worker(&self, worker_id: &WorkerId) -> Result<(), SupervisorError> {
        let entry = self.shared.workers.remove(worker_id)?;
        entry.shutdown.cancel();
        tracing::info!(%worker_id, "Removed worker {worker_id}");
        Ok(())
    }

    /// Stop selecting a worker for new jobs. A running job is allowed to finish.
    pub fn drain_worker(&self, worker_id: &WorkerId) -> Result<(), SupervisorError> {
        self.shared.workers.drain(worker_id)?;
        tracing::info!(%worker_id, "Draining worker {worker_id}");
        Ok(())
    }

    pub fn resume_worker(&self, worker_id: &WorkerId) -> Result<(), SupervisorError> {
        self.shared.workers.resume(worker_id)?;
        self.shared.worker_available.notify_one();
        tracing::info!(%worker_id, "Resumed worker {worker_id}");
        Ok(())
    }

    /// Report that a worker is alive.
    pub fn record_heartbeat(&self, worker_id: &WorkerId) -> Result<(), SupervisorError> {
        if self.shared.workers.heartbeat(worker_id)? {
            self.shared.worker_available.notify_one();
        }
        Ok(())
    }

    /// Accept a job for execution.
    ///
    /// The job is visible to [`Supervisor::job_status`] as soon as this returns. Jobs submitted
    /// before [`Supervisor::start`] wait on the queue.
    ///
    /// When the queue is full the job is recorded as failed and [`SupervisorError::QueueFull`]
    /// is returned.
    pub fn submit_job(&self, mut job: Job) -> Result<JobId, SupervisorError> {
        if job.job_type.is_empty() {
            return Err(SupervisorError::InvalidJob(
                "job type must not be empty".to_owned(),
            ));
        }
        if job.id.as_str().is_empty() {
            return Err(SupervisorError::InvalidJob(
                "job id must not be empty".to_owned(),
            ));
        }
        if self.shared.cancellation.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }

        job.max_retries.get_or_insert(self.shared.config.retry_attempts);
        job.status = JobStatus::Pending;
        job.retry_count = 0;
        job.attempt = 0;
        job.assigned_worker = None;
        job.started_at = None;
        job.completed_at = None;
        job.executions.clear();

        let job_id = job.id.clone();
        let job_type = job.job_type.clone();
        self.shared.jobs.insert(job)?;
        self.shared.enqueue(job_id.clone())?;
        tracing::debug!(%job_id, %job_type, "Submitted job {job_id}");
        Ok(job_id)
    }

    /// Cancel a pending or running job.
    pub fn cancel_job(&self, job_id: &JobId) -> Result<(), SupervisorError> {
        match self.shared.jobs.cancel(job_id)? {
            Some(outcome) => {
                tracing::info!(%job_id, "Job {job_id} cancelled");
                self.shared.publish(outcome);
            }
            None => tracing::debug!(%job_id, "Cancelling running job {job_id}"),
        }
        Ok(())
    }

    pub fn job_status(&self, job_id: &JobId) -> Result<Job, SupervisorError> {
        self.shared.jobs.get(job_id)
    }

    /// The finished attempts of a job, oldest first.
    pub fn job_executions(&self, job_id: &JobId) -> Result<Vec<JobExecution>, SupervisorError> {
        Ok(self.shared.jobs.get(job_id)?.executions)
    }

    pub fn query_jobs(&self, query: &JobQuery) -> Result<Vec<Job>, SupervisorError> {
        self.shared.jobs.query(query)
    }

    pub fn worker_status(&self) -> Result<Vec<Worker>, SupervisorError> {
        self.shared.workers.snapshot()
    }

    pub fn stats(&self) -> Result<SupervisorStats, SupervisorError> {
        SupervisorStats::collect(&self.shared)
    }

    pub fn state(&self) -> Result<SupervisorState, SupervisorError> {
        self.shared.state()
    }

    /// Receive every terminal job outcome from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobOutcome> {
        self.shared.subscribe()
    }

    /// Terminal job outcomes as a stream. Outcomes missed by a slow consumer are skipped.
    pub fn outcomes(&self) -> impl Stream<Item = JobOutcome> {
        let mut receiver = self.subscribe();
        async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(outcome) => yield outcome,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Outcome stream lagged, skipped {skipped} outcomes");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shared.cancellation.cancel();
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid job: {0}")]
    InvalidJob(String),
    #[error("A job with id {0} already exists")]
    DuplicateJob(JobId),
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Job {0} has already finished")]
    JobFinished(JobId),
    #[error("Worker {0} not found")]
    WorkerNotFound(WorkerId),
    #[error("A worker with id {0} already exists")]
    DuplicateWorker(WorkerId),
    #[error("Worker {0} is running a job")]
    WorkerBusy(WorkerId),
    #[error("The job queue is full, job {0} was not queued")]
    QueueFull(JobId),
    #[error("The worker pool is full ({0} workers)")]
    PoolFull(usize),
    #[error("The supervisor is already running")]
    AlreadyRunning,
    #[error("The supervisor is not running")]
    NotRunning,
    #[error("The supervisor is shutting down")]
    ShuttingDown,
    #[error("The supervisor did not stop within {0:?}")]
    ShutdownTimeout(Duration),
    #[error("Internal state is poisoned")]
    BadState,
    #[error("Error encoding or decoding value")]
    EncodeError(#[from] serde_json::Error),
}
