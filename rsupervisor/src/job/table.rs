use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use crate::{backoff::BackoffStrategy, worker::WorkerId, SupervisorError};

use super::{
    query::JobQuery, runner::ExecutionReport, runner::Outcome, Job, JobExecution, JobId,
    JobOutcome, JobStatus,
};

type Result<T> = std::result::Result<T, SupervisorError>;

struct JobEntry {
    job: Job,
    /// Present while the job is running.
    cancellation: Option<CancellationToken>,
}

/// What the result processor has to do after a report was applied.
#[derive(Debug, PartialEq)]
pub(crate) enum Followup {
    /// Re-enqueue the job after the delay.
    Retry(Duration),
    /// The job reached a terminal state.
    Finished(JobOutcome),
    /// The report belonged to a superseded attempt or an unknown job.
    Ignored,
}

/// The live job table.
#[derive(Default)]
pub(crate) struct JobTable {
    jobs: RwLock<HashMap<JobId, JobEntry>>,
}

impl JobTable {
    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, JobEntry>>> {
        self.jobs.read().map_err(|_| SupervisorError::BadState)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, JobEntry>>> {
        self.jobs.write().map_err(|_| SupervisorError::BadState)
    }

    pub fn insert(&self, job: Job) -> Result<()> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(SupervisorError::DuplicateJob(job.id));
        }
        jobs.insert(
            job.id.clone(),
            JobEntry {
                job,
                cancellation: None,
            },
        );
        Ok(())
    }

    pub fn get(&self, job_id: &JobId) -> Result<Job> {
        self.read()?
            .get(job_id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| SupervisorError::JobNotFound(job_id.clone()))
    }

    /// A snapshot of the job if it is still waiting to run.
    pub fn pending(&self, job_id: &JobId) -> Result<Option<Job>> {
        Ok(self
            .read()?
            .get(job_id)
            .filter(|entry| entry.job.status == JobStatus::Pending)
            .map(|entry| entry.job.clone()))
    }

    /// Jobs matching the query, most urgent first, then oldest first.
    pub fn query(&self, query: &JobQuery) -> Result<Vec<Job>> {
        let mut jobs: Vec<_> = self
            .read()?
            .values()
            .filter(|entry| query.matches(&entry.job))
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(jobs)
    }

    /// Mark a pending job as running on `worker_id`.
    ///
    /// Returns the job as handed to the worker, or `None` if it is no longer pending.
    pub fn begin_attempt(
        &self,
        job_id: &JobId,
        worker_id: &WorkerId,
        cancellation: CancellationToken,
    ) -> Result<Option<Job>> {
        let mut jobs = self.write()?;
        let Some(entry) = jobs
            .get_mut(job_id)
            .filter(|entry| entry.job.status == JobStatus::Pending)
        else {
            return Ok(None);
        };
        let job = &mut entry.job;
        job.status = JobStatus::Running;
        job.attempt += 1;
        job.assigned_worker = Some(worker_id.clone());
        job.started_at = Some(Utc::now());
        entry.cancellation = Some(cancellation);
        Ok(Some(job.clone()))
    }

    /// Apply an execution report and decide what happens next.
    pub fn apply(
        &self,
        report: &ExecutionReport,
        backoff: &BackoffStrategy,
        default_max_retries: u32,
    ) -> Result<Followup> {
        let mut jobs = self.write()?;
        let Some(entry) = jobs.get_mut(&report.job_id) else {
            return Ok(Followup::Ignored);
        };
        let job = &mut entry.job;
        let is_current = job.attempt == report.attempt
            && match &report.worker_id {
                Some(worker_id) => {
                    job.status == JobStatus::Running
                        && job.assigned_worker.as_ref() == Some(worker_id)
                }
                None => job.status == JobStatus::Pending,
            };
        if !is_current {
            return Ok(Followup::Ignored);
        }

        let now = Utc::now();
        let error = report.outcome.error();
        job.executions.push(JobExecution {
            attempt: report.attempt,
            worker_id: report.worker_id.clone(),
            status: report.outcome.status(),
            error: error.clone(),
            started_at: report.started_at,
            finished_at: now,
            duration: report.duration,
        });
        entry.cancellation = None;
        job.error = error.map(|error| error.message);

        match &report.outcome {
            Outcome::Completed(value) => {
                job.status = JobStatus::Completed;
                job.result = Some(value.clone());
            }
            outcome if outcome.is_retryable() => {
                let max_retries = job.max_retries.unwrap_or(default_max_retries);
                if job.retry_count < max_retries {
                    job.retry_count += 1;
                    job.status = JobStatus::Pending;
                    job.assigned_worker = None;
                    job.started_at = None;
                    return Ok(Followup::Retry(backoff.backoff(job.retry_count)));
                }
                job.status = JobStatus::Failed;
            }
            outcome => job.status = outcome.status(),
        }
        job.completed_at = Some(now);
        Ok(Followup::Finished(JobOutcome::from(&*job)))
    }

    /// Return a job held by a lost worker to pending and abort its execution.
    ///
    /// Returns true if the job was reclaimed and needs to be re-enqueued.
    pub fn reclaim(&self, job_id: &JobId, worker_id: &WorkerId) -> Result<bool> {
        let mut jobs = self.write()?;
        let Some(entry) = jobs.get_mut(job_id).filter(|entry| {
            entry.job.status == JobStatus::Running
                && entry.job.assigned_worker.as_ref() == Some(worker_id)
        }) else {
            return Ok(false);
        };
        if let Some(cancellation) = entry.cancellation.take() {
            cancellation.cancel();
        }
        let job = &mut entry.job;
        job.status = JobStatus::Pending;
        job.assigned_worker = None;
        job.started_at = None;
        Ok(true)
    }

    /// Cancel a job.
    ///
    /// A pending job is cancelled right away and its outcome returned. A running job has its
    /// execution aborted and is finished by the result processor.
    pub fn cancel(&self, job_id: &JobId) -> Result<Option<JobOutcome>> {
        let mut jobs = self.write()?;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| SupervisorError::JobNotFound(job_id.clone()))?;
        match entry.job.status {
            JobStatus::Pending => {
                let job = &mut entry.job;
                job.status = JobStatus::Cancelled;
                job.error = Some("job cancelled".to_owned());
                job.completed_at = Some(Utc::now());
                Ok(Some(JobOutcome::from(&*job)))
            }
            JobStatus::Running => {
                if let Some(cancellation) = &entry.cancellation {
                    cancellation.cancel();
                }
                Ok(None)
            }
            _ => Err(SupervisorError::JobFinished(job_id.clone())),
        }
    }

    /// Remove terminal jobs that finished more than `retention` before `now`.
    pub fn prune(&self, retention: Duration, now: DateTime<Utc>) -> Result<usize> {
        let Some(cutoff) = TimeDelta::from_std(retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
        else {
            return Ok(0);
        };
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|_, entry| {
            !(entry.job.is_terminal()
                && entry
                    .job
                    .completed_at
                    .is_some_and(|completed_at| completed_at < cutoff))
        });
        Ok(before - jobs.len())
    }

    pub fn counts(&self) -> Result<HashMap<JobStatus, usize>> {
        let jobs = self.read()?;
        let mut counts: HashMap<_, _> = JobStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for entry in jobs.values() {
            *counts.entry(entry.job.status).or_default() += 1;
        }
        Ok(counts)
    }
}
