//! The single loop applying execution reports.
//!
//! Every state change that follows an execution goes through here: worker statistics are
//! updated and the worker freed, then the job is completed, failed or scheduled for a retry.
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{
    job::{runner::ExecutionReport, table::Followup, JobStatus},
    shared::Shared,
    SupervisorError,
};

pub(crate) struct ResultProcessor {
    shared: Arc<Shared>,
    results: mpsc::Receiver<ExecutionReport>,
}

impl ResultProcessor {
    pub fn new(shared: Arc<Shared>, results: mpsc::Receiver<ExecutionReport>) -> Self {
        Self { shared, results }
    }

    pub fn spawn(self) {
        let tracker = self.shared.tracker.clone();
        tracker.spawn(self.run());
    }

    async fn run(mut self) {
        loop {
            let report = tokio::select! {
                _ = self.shared.cancellation.cancelled() => break,
                report = self.results.recv() => match report {
                    Some(report) => report,
                    None => break,
                },
            };
            let job_id = report.job_id.clone();
            let _ = self.process(report).inspect_err(|err| {
                tracing::error!(?err, %job_id, "Failed to process the result of job {job_id}: {err}")
            });
        }
        tracing::debug!("Shutting down the result processor");
    }

    pub(crate) fn process(&self, report: ExecutionReport) -> Result<(), SupervisorError> {
        let shared = &self.shared;
        let job_id = &report.job_id;

        if let Some(worker_id) = &report.worker_id {
            let freed = shared.workers.record_and_release(
                worker_id,
                job_id,
                report.outcome.worker_success(),
                report.duration,
            )?;
            if freed {
                shared.worker_available.notify_one();
            }
        }

        let backoff = shared.backoff()?;
        match shared
            .jobs
            .apply(&report, &backoff, shared.config.retry_attempts)?
        {
            Followup::Retry(delay) => {
                let error = report.outcome.error();
                tracing::warn!(
                    %job_id,
                    ?error,
                    "Job {job_id} failed and will be retried in {delay:?}"
                );
                shared.enqueue_after(job_id.clone(), delay);
            }
            Followup::Finished(outcome) => {
                let error = outcome.error.as_deref().unwrap_or_default();
                match outcome.status {
                    JobStatus::Completed => tracing::debug!(%job_id, "Job {job_id} complete"),
                    JobStatus::Cancelled => tracing::info!(%job_id, "Job {job_id} cancelled"),
                    status => tracing::error!(
                        %job_id,
                        %status,
                        "Job {job_id} finished as {status}: {error}"
                    ),
                }
                shared.publish(outcome);
            }
            Followup::Ignored => {
                tracing::debug!(%job_id, "Ignoring result of a superseded attempt of job {job_id}");
            }
        }
        Ok(())
    }
}
