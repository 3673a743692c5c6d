use std::collections::HashMap;

use serde::Serialize;

use crate::{
    circuit_breaker::CircuitState, job::JobStatus, shared::Shared, worker::WorkerStatus,
    SupervisorError, SupervisorState,
};

/// A point in time view of the supervisor.
///
/// Each table is read under its own lock, one after the other, so the sections may be skewed
/// against each other by changes made in between. For example a job that finished while the
/// snapshot was taken can be counted as completed while its worker is still counted busy.
/// Counts within one section are always consistent.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStats {
    pub state: SupervisorState,
    pub health_score: f64,
    pub workers: usize,
    pub workers_by_status: HashMap<WorkerStatus, usize>,
    pub jobs_by_status: HashMap<JobStatus, usize>,
    pub queue_depth: usize,
    pub handlers: usize,
    /// `None` when the circuit breaker is disabled.
    pub circuit_state: Option<CircuitState>,
    pub circuit_failures: u32,
}

impl SupervisorStats {
    pub(crate) fn collect(shared: &Shared) -> Result<Self, SupervisorError> {
        let workers_by_status = shared.workers.counts()?;
        let (circuit_state, circuit_failures) = match &shared.breaker {
            Some(breaker) => (Some(breaker.state()?), breaker.failure_count()?),
            None => (None, 0),
        };
        Ok(Self {
            state: shared.state()?,
            health_score: shared.health_score()?,
            workers: workers_by_status.values().sum(),
            workers_by_status,
            jobs_by_status: shared.jobs.counts()?,
            queue_depth: shared.queue.depth(),
            handlers: shared.handlers.len()?,
            circuit_state,
            circuit_failures,
        })
    }

    pub fn jobs(&self, status: JobStatus) -> usize {
        self.jobs_by_status.get(&status).copied().unwrap_or_default()
    }

    pub fn workers_in(&self, status: WorkerStatus) -> usize {
        self.workers_by_status
            .get(&status)
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::SupervisorConfig,
        job::Job,
        worker::{table::test::detached_entry, GENERAL_CAPABILITY},
    };

    #[test]
    fn every_section_is_counted() {
        let (shared, _queue, _results) =
            Shared::new(SupervisorConfig::default().without_circuit_breaker());
        let (first, _first_mailbox) = detached_entry("first", &[GENERAL_CAPABILITY], false);
        let (second, _second_mailbox) = detached_entry("second", &["echo"], false);
        shared.workers.insert(first, 10).unwrap();
        shared.workers.insert(second, 10).unwrap();
        shared.workers.claim("echo", &"job-1".into(), 10, 0.5).unwrap().unwrap();
        for id in ["job-1", "job-2"] {
            shared.jobs.insert(Job::new(id, "echo")).unwrap();
            shared.enqueue(id.into()).unwrap();
        }

        let stats = SupervisorStats::collect(&shared).unwrap();
        assert_eq!(stats.state, SupervisorState::Inactive);
        assert_eq!(stats.workers, 2);
        assert_eq!(stats.workers_in(WorkerStatus::Busy), 1);
        assert_eq!(stats.workers_in(WorkerStatus::Idle), 1);
        assert_eq!(stats.workers_in(WorkerStatus::Offline), 0);
        assert_eq!(stats.jobs(JobStatus::Pending), 2);
        assert_eq!(stats.queue_depth, 2);
        assert_eq!(stats.circuit_state, None);
    }
}
