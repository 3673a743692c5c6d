//! The loop matching queued jobs to workers.
//!
//! For every job pulled off the queue the dispatcher:
//!
//! - skips it if it is no longer pending (for example cancelled while queued),
//! - expires it if its deadline has passed,
//! - fails it fast if its handler is protected and the circuit breaker is open,
//! - otherwise claims the best scoring idle worker able to serve it and hands the job over.
//!
//! A job no live worker is able to serve is put back on the queue after the dispatch retry delay
//! without holding up the jobs behind it. When capable workers exist but none is available the
//! job is held until a worker frees up or the dispatch retry delay passes, then tried once more. If that fails too it goes back on the queue, and if the
//! queue is full it is dropped and marked failed.
use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::{
    circuit_breaker::CIRCUIT_OPEN_MESSAGE,
    config::SupervisorConfig,
    job::{
        runner::{ExecutionReport, Outcome},
        ErrorType, ExecutionError, Job, JobId,
    },
    shared::Shared,
    worker::runner::Assignment,
    SupervisorError,
};

const DROPPED_MESSAGE: &str = "no worker available and the job queue is full";

pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    queue: mpsc::Receiver<JobId>,
    /// Jobs already reported as having no capable worker.
    unservable: HashSet<JobId>,
}

impl Dispatcher {
    pub fn new(shared: Arc<Shared>, queue: mpsc::Receiver<JobId>) -> Self {
        Self {
            shared,
            queue,
            unservable: HashSet::new(),
        }
    }

    pub fn spawn(self) {
        let tracker = self.shared.tracker.clone();
        tracker.spawn(self.run());
    }

    async fn run(mut self) {
        loop {
            let job_id = tokio::select! {
                _ = self.shared.cancellation.cancelled() => break,
                job_id = self.queue.recv() => match job_id {
                    Some(job_id) => job_id,
                    None => break,
                },
            };
            let _ = self.dispatch(&job_id).await.inspect_err(|err| {
                tracing::error!(?err, %job_id, "Failed to dispatch job {job_id}: {err}")
            });
        }
        tracing::debug!("Shutting down the job dispatcher");
    }

    async fn dispatch(&mut self, job_id: &JobId) -> Result<(), SupervisorError> {
        let Some(job) = self.shared.jobs.pending(job_id)? else {
            tracing::debug!(%job_id, "Job {job_id} is no longer pending, skipping");
            self.unservable.remove(job_id);
            return Ok(());
        };

        if job.deadline.is_some_and(|deadline| deadline <= Utc::now()) {
            tracing::warn!(%job_id, "Job {job_id} missed its deadline before it could run");
            self.unservable.remove(job_id);
            self.shared
                .report(ExecutionReport::without_worker(&job, Outcome::Expired))
                .await;
            return Ok(());
        }

        if self.circuit_open_for(&job)? {
            tracing::debug!(%job_id, "Circuit breaker open, failing job {job_id}");
            self.unservable.remove(job_id);
            let error = ExecutionError::new(ErrorType::CircuitOpen, CIRCUIT_OPEN_MESSAGE);
            self.shared
                .report(ExecutionReport::without_worker(&job, Outcome::Failed(error)))
                .await;
            return Ok(());
        }

        if !self.shared.workers.any_can_serve(&job.job_type)? {
            self.defer_unservable(&job);
            return Ok(());
        }
        self.unservable.remove(job_id);

        if self.try_place(&job)? {
            return Ok(());
        }

        tokio::select! {
            _ = self.shared.worker_available.notified() => {}
            _ = tokio::time::sleep(self.shared.config.dispatch_retry_delay) => {}
            _ = self.shared.cancellation.cancelled() => return Ok(()),
        }

        let Some(job) = self.shared.jobs.pending(job_id)? else {
            return Ok(());
        };
        if self.try_place(&job)? {
            return Ok(());
        }

        match self.shared.queue.offer(job_id.clone()) {
            Ok(()) => {
                tracing::debug!(%job_id, "No worker available for job {job_id}, requeued");
            }
            Err(_) => {
                tracing::warn!(
                    %job_id,
                    "No worker available for job {job_id} and the job queue is full, dropping it"
                );
                self.shared
                    .report(ExecutionReport::without_worker(
                        &job,
                        Outcome::Dropped(DROPPED_MESSAGE.to_owned()),
                    ))
                    .await;
            }
        }
        Ok(())
    }

    fn defer_unservable(&mut self, job: &Job) {
        let job_id = &job.id;
        let job_type = &job.job_type;
        if self.unservable.insert(job_id.clone()) {
            tracing::warn!(
                %job_id,
                %job_type,
                "No worker can serve job {job_id} of type {job_type}, waiting for one"
            );
        }
        self.shared
            .enqueue_after(job_id.clone(), self.shared.config.dispatch_retry_delay);
    }

    fn circuit_open_for(&self, job: &Job) -> Result<bool, SupervisorError> {
        let Some(breaker) = &self.shared.breaker else {
            return Ok(false);
        };
        let protected = self
            .shared
            .handlers
            .get(&job.job_type)?
            .is_some_and(|handler| handler.is_protected());
        if !protected {
            return Ok(false);
        }
        breaker.is_open()
    }

    /// Hand the job to the best available worker. Returns false if there was none.
    fn try_place(&self, job: &Job) -> Result<bool, SupervisorError> {
        let shared = &self.shared;
        let Some(claim) = shared.workers.claim(
            &job.job_type,
            &job.id,
            shared.config.max_concurrent_jobs,
            shared.config.new_worker_success_rate,
        )?
        else {
            return Ok(false);
        };
        let worker_id = claim.worker_id;
        let job_id = &job.id;

        let cancellation = shared.cancellation.child_token();
        let Some(running) = shared
            .jobs
            .begin_attempt(job_id, &worker_id, cancellation.clone())?
        else {
            // Cancelled between the lookup and the claim.
            shared.workers.release(&worker_id, job_id)?;
            shared.worker_available.notify_one();
            return Ok(true);
        };

        let assignment = Assignment {
            attempt: running.attempt,
            timeout: execution_timeout(&running, &shared.config, Utc::now()),
            job: running,
            cancellation,
        };
        match claim.mailbox.try_send(assignment) {
            Ok(()) => {
                tracing::debug!(%job_id, %worker_id, "Dispatched job {job_id} to worker {worker_id}");
            }
            Err(_) => {
                tracing::error!(
                    %job_id,
                    %worker_id,
                    "Worker {worker_id} did not accept job {job_id}, marking the worker as errored"
                );
                shared.workers.mark_error(&worker_id)?;
                if shared.jobs.reclaim(job_id, &worker_id)? {
                    let _ = shared.enqueue(job_id.clone()).inspect_err(|err| {
                        tracing::error!(?err, %job_id, "Failed to requeue job {job_id}: {err}")
                    });
                }
            }
        }
        Ok(true)
    }
}

/// The time a job may run: the shortest of its own timeout, the global timeout and the time left
/// until its deadline.
pub(crate) fn execution_timeout(
    job: &Job,
    config: &SupervisorConfig,
    now: DateTime<Utc>,
) -> Duration {
    let mut timeout = config.job_timeout;
    if let Some(job_timeout) = job.timeout {
        timeout = timeout.min(job_timeout);
    }
    if let Some(deadline) = job.deadline {
        let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);
        timeout = timeout.min(remaining);
    }
    timeout
}
