use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    backoff::BackoffStrategy,
    circuit_breaker::CircuitBreaker,
    config::SupervisorConfig,
    handler::HandlerRegistry,
    job::{
        runner::{ExecutionReport, Outcome},
        table::{Followup, JobTable},
        JobId, JobOutcome,
    },
    worker::{
        runner::WorkerRunner,
        table::{WorkerEntry, WorkerTable},
        Worker, WorkerId,
    },
    SupervisorError, SupervisorState,
};

const OUTCOME_CHANNEL_CAPACITY: usize = 1024;
const QUEUE_FULL_MESSAGE: &str = "the job queue is full";

/// The job queue feeding the dispatcher. Carries job ids; the job table holds the jobs.
pub(crate) struct JobQueue {
    sender: mpsc::Sender<JobId>,
}

impl JobQueue {
    pub fn offer(&self, job_id: JobId) -> Result<(), mpsc::error::TrySendError<JobId>> {
        self.sender.try_send(job_id)
    }

    pub async fn send(&self, job_id: JobId) -> Result<(), mpsc::error::SendError<JobId>> {
        self.sender.send(job_id).await
    }

    pub fn depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

#[derive(Debug, Clone, Copy)]
struct Health {
    state: SupervisorState,
    score: f64,
}

/// State shared between the public handle and all background tasks.
pub(crate) struct Shared {
    pub config: SupervisorConfig,
    pub jobs: JobTable,
    pub workers: WorkerTable,
    pub handlers: HandlerRegistry,
    pub breaker: Option<CircuitBreaker>,
    pub queue: JobQueue,
    /// Signalled whenever a worker may have become available.
    pub worker_available: Notify,
    pub cancellation: CancellationToken,
    pub tracker: TaskTracker,
    results: mpsc::Sender<ExecutionReport>,
    outcomes: broadcast::Sender<JobOutcome>,
    health: RwLock<Health>,
    backoff: RwLock<BackoffStrategy>,
}

impl Shared {
    pub fn new(
        config: SupervisorConfig,
    ) -> (
        Self,
        mpsc::Receiver<JobId>,
        mpsc::Receiver<ExecutionReport>,
    ) {
        let (queue, queue_receiver) = mpsc::channel(config.queue_capacity);
        let (results, results_receiver) = mpsc::channel(config.result_queue_capacity);
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        let breaker = config.enable_circuit_breaker.then(|| {
            CircuitBreaker::new(
                config.circuit_breaker_threshold,
                config.circuit_breaker_timeout,
            )
        });
        let backoff = BackoffStrategy::linear(config.retry_backoff);

        let shared = Self {
            jobs: JobTable::default(),
            workers: WorkerTable::default(),
            handlers: HandlerRegistry::default(),
            breaker,
            queue: JobQueue { sender: queue },
            worker_available: Notify::new(),
            cancellation: CancellationToken::new(),
            tracker: TaskTracker::new(),
            results,
            outcomes,
            health: RwLock::new(Health {
                state: SupervisorState::Inactive,
                score: 1.0,
            }),
            backoff: RwLock::new(backoff),
            config,
        };
        (shared, queue_receiver, results_receiver)
    }

    /// Hand an execution report to the result processor.
    ///
    /// Waits while the result queue is full; gives up when the supervisor stops.
    pub async fn report(&self, report: ExecutionReport) {
        let job_id = report.job_id.clone();
        tokio::select! {
            sent = self.results.send(report) => {
                if sent.is_err() {
                    tracing::warn!(%job_id, "Result queue closed, dropping the result of job {job_id}");
                }
            }
            _ = self.cancellation.cancelled() => {
                tracing::debug!(%job_id, "Supervisor stopping, dropping the result of job {job_id}");
            }
        }
    }

    /// Publish a terminal job outcome to subscribers.
    pub fn publish(&self, outcome: JobOutcome) {
        // Sending only fails without subscribers.
        let _ = self.outcomes.send(outcome);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobOutcome> {
        self.outcomes.subscribe()
    }

    /// Put a job on the queue without waiting.
    ///
    /// A job that finds the queue full is failed and the outcome published.
    pub fn enqueue(&self, job_id: JobId) -> Result<(), SupervisorError> {
        match self.queue.offer(job_id) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(job_id)) => {
                tracing::warn!(%job_id, "Job queue full, dropping job {job_id}");
                self.drop_job(&job_id, QUEUE_FULL_MESSAGE)?;
                Err(SupervisorError::QueueFull(job_id))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SupervisorError::ShuttingDown),
        }
    }

    /// Put a job on the queue after `delay`.
    pub fn enqueue_after(self: &Arc<Self>, job_id: JobId, delay: Duration) {
        let shared = self.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = shared.enqueue(job_id.clone()).inspect_err(|err| {
                        tracing::warn!(?err, %job_id, "Failed to requeue job {job_id}: {err}")
                    });
                }
                _ = shared.cancellation.cancelled() => {}
            }
        });
    }

    /// Fail a pending job that cannot be queued.
    pub fn drop_job(&self, job_id: &JobId, reason: &str) -> Result<(), SupervisorError> {
        let Some(job) = self.jobs.pending(job_id)? else {
            return Ok(());
        };
        let report = ExecutionReport::without_worker(&job, Outcome::Dropped(reason.to_owned()));
        let followup = self
            .jobs
            .apply(&report, &self.backoff()?, self.config.retry_attempts)?;
        if let Followup::Finished(outcome) = followup {
            self.publish(outcome);
        }
        Ok(())
    }

    /// Create a worker, start its task and make it available to the dispatcher.
    pub fn spawn_worker(
        self: &Arc<Self>,
        worker_id: Option<WorkerId>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        tags: HashMap<String, String>,
    ) -> Result<WorkerId, SupervisorError> {
        if self.cancellation.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }
        let worker_id = match worker_id {
            Some(worker_id) => worker_id,
            None => self.workers.generate_id()?,
        };
        let (mailbox, receiver) = mpsc::channel(1);
        let shutdown = self.cancellation.child_token();
        let entry = WorkerEntry {
            worker: Worker::new(worker_id.clone(), capabilities, tags),
            mailbox,
            shutdown: shutdown.clone(),
        };
        self.workers.insert(entry, self.config.max_workers)?;
        WorkerRunner::new(self.clone(), worker_id.clone(), receiver, shutdown).spawn();
        self.worker_available.notify_one();
        Ok(worker_id)
    }

    pub fn backoff(&self) -> Result<BackoffStrategy, SupervisorError> {
        Ok(*self.backoff.read().map_err(|_| SupervisorError::BadState)?)
    }

    pub fn set_backoff(&self, strategy: BackoffStrategy) -> Result<(), SupervisorError> {
        *self.backoff.write().map_err(|_| SupervisorError::BadState)? = strategy;
        Ok(())
    }

    pub fn state(&self) -> Result<SupervisorState, SupervisorError> {
        Ok(self.health.read().map_err(|_| SupervisorError::BadState)?.state)
    }

    pub fn health_score(&self) -> Result<f64, SupervisorError> {
        Ok(self.health.read().map_err(|_| SupervisorError::BadState)?.score)
    }

    pub fn set_state(&self, state: SupervisorState) -> Result<SupervisorState, SupervisorError> {
        let mut health = self.health.write().map_err(|_| SupervisorError::BadState)?;
        Ok(std::mem::replace(&mut health.state, state))
    }

    /// Record a new health score and derive the state from it while running.
    pub fn record_health(&self, score: f64) -> Result<(), SupervisorError> {
        let mut health = self.health.write().map_err(|_| SupervisorError::BadState)?;
        health.score = score;
        if !health.state.is_running() {
            return Ok(());
        }
        let state = SupervisorState::from_health(score);
        if state != health.state {
            match state {
                SupervisorState::Active => {
                    tracing::info!(score, "Supervisor recovered, state {state}")
                }
                _ => tracing::warn!(score, "Supervisor health dropped, state {state}"),
            }
            health.state = state;
        }
        Ok(())
    }
}
