use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    job::{runner::JobRunner, Job},
    shared::Shared,
};

use super::WorkerId;

/// A job handed to a worker by the dispatcher.
#[derive(Debug)]
pub(crate) struct Assignment {
    pub job: Job,
    pub attempt: u32,
    pub timeout: Duration,
    /// Fires when the job is cancelled, its worker is lost or the supervisor stops.
    pub cancellation: CancellationToken,
}

/// The task behind a single worker.
///
/// Receives assignments one at a time through its mailbox and heartbeats on the health check
/// interval, including while a job is executing.
pub(crate) struct WorkerRunner {
    shared: Arc<Shared>,
    worker_id: WorkerId,
    mailbox: mpsc::Receiver<Assignment>,
    shutdown: CancellationToken,
}

impl WorkerRunner {
    pub fn new(
        shared: Arc<Shared>,
        worker_id: WorkerId,
        mailbox: mpsc::Receiver<Assignment>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            shared,
            worker_id,
            mailbox,
            shutdown,
        }
    }

    pub fn spawn(self) {
        let tracker = self.shared.tracker.clone();
        tracker.spawn(self.run());
    }

    async fn run(self) {
        let Self {
            shared,
            worker_id,
            mut mailbox,
            shutdown,
        } = self;
        let runner = JobRunner::new(shared.clone(), worker_id.clone());
        let mut heartbeat = tokio::time::interval(shared.config.health_check_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = heartbeat.tick() => beat(&shared, &worker_id),
                assignment = mailbox.recv() => {
                    let Some(assignment) = assignment else {
                        break;
                    };
                    let execution = runner.execute(assignment);
                    tokio::pin!(execution);
                    let report = loop {
                        tokio::select! {
                            report = &mut execution => break report,
                            _ = heartbeat.tick() => beat(&shared, &worker_id),
                        }
                    };
                    shared.report(report).await;
                }
            }
        }
        tracing::debug!(%worker_id, "Shutting down worker {worker_id}");
    }
}

fn beat(shared: &Shared, worker_id: &WorkerId) {
    match shared.workers.heartbeat(worker_id) {
        Ok(true) => shared.worker_available.notify_one(),
        Ok(false) => {}
        Err(err) => tracing::error!(
            ?err,
            %worker_id,
            "Failed to record heartbeat for worker {worker_id}: {err}"
        ),
    }
}
