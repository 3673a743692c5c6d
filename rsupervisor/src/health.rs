//! The periodic health check.
//!
//! On every tick:
//!
//! 1. workers silent for more than three heartbeat intervals are marked offline, and any job they
//!    were holding goes back to pending and onto the queue,
//! 2. worker health scores and the supervisor health score are recomputed, driving the
//!    supervisor state between active, degraded and error,
//! 3. finished jobs past the retention window are pruned.
use std::sync::Arc;

use chrono::Utc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::{shared::Shared, SupervisorError};

const MISSED_HEARTBEATS: u32 = 3;

pub(crate) struct HealthChecker {
    shared: Arc<Shared>,
}

impl HealthChecker {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn spawn(self) {
        let tracker = self.shared.tracker.clone();
        tracker.spawn(self.run());
    }

    async fn run(self) {
        let period = self.shared.config.health_check_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let _ = self.check().inspect_err(|err| {
                        tracing::error!(?err, "Health check failed: {err}")
                    });
                }
                _ = self.shared.cancellation.cancelled() => break,
            }
        }
        tracing::debug!("Shutting down the health checker");
    }

    pub(crate) fn check(&self) -> Result<(), SupervisorError> {
        self.reclaim_lost_workers()?;
        let score = self.refresh_health()?;
        self.shared.record_health(score)?;

        let pruned = self
            .shared
            .jobs
            .prune(self.shared.config.job_retention, Utc::now())?;
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned {pruned} finished jobs");
        }
        Ok(())
    }

    fn reclaim_lost_workers(&self) -> Result<(), SupervisorError> {
        let stale_after = self.shared.config.health_check_interval * MISSED_HEARTBEATS;
        for lost in self.shared.workers.mark_unresponsive(stale_after)? {
            let worker_id = &lost.worker_id;
            tracing::warn!(%worker_id, "Worker {worker_id} missed its heartbeats, marking it offline");
            let Some(job_id) = lost.job_id else {
                continue;
            };
            if self.shared.jobs.reclaim(&job_id, worker_id)? {
                tracing::warn!(
                    %job_id,
                    %worker_id,
                    "Requeueing job {job_id} held by offline worker {worker_id}"
                );
                let _ = self.shared.enqueue(job_id.clone()).inspect_err(|err| {
                    tracing::error!(?err, %job_id, "Failed to requeue job {job_id}: {err}")
                });
            }
        }
        Ok(())
    }

    /// The supervisor health score: mostly the average worker health, partly the circuit breaker.
    ///
    /// A supervisor without workers cannot make progress and scores 0.
    fn refresh_health(&self) -> Result<f64, SupervisorError> {
        let Some(workers) = self
            .shared
            .workers
            .refresh_health(self.shared.config.new_worker_success_rate)?
        else {
            return Ok(0.0);
        };
        let circuit = match &self.shared.breaker {
            Some(breaker) => breaker.state()?.health(),
            None => 1.0,
        };
        Ok(0.7 * workers + 0.3 * circuit)
    }
}
