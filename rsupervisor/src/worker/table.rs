use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::Duration,
};

use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{job::JobId, SupervisorError};

use super::{runner::Assignment, Worker, WorkerId, WorkerStatus};

type Result<T> = std::result::Result<T, SupervisorError>;

pub(crate) struct WorkerEntry {
    pub worker: Worker,
    pub mailbox: mpsc::Sender<Assignment>,
    pub shutdown: CancellationToken,
}

/// A worker reserved for a job by [`WorkerTable::claim`].
pub(crate) struct Claim {
    pub worker_id: WorkerId,
    pub mailbox: mpsc::Sender<Assignment>,
}

/// A worker marked offline and the job it was holding.
#[derive(Debug, PartialEq)]
pub(crate) struct LostWorker {
    pub worker_id: WorkerId,
    pub job_id: Option<JobId>,
}

/// The worker set.
///
/// Entries keep insertion order, which is the tie-break order for worker selection.
#[derive(Default)]
pub(crate) struct WorkerTable {
    entries: RwLock<Vec<WorkerEntry>>,
    next_id: AtomicU64,
}

impl WorkerTable {
    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<WorkerEntry>>> {
        self.entries.read().map_err(|_| SupervisorError::BadState)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<WorkerEntry>>> {
        self.entries.write().map_err(|_| SupervisorError::BadState)
    }

    /// A `worker-<n>` id not yet used by any worker.
    pub fn generate_id(&self) -> Result<WorkerId> {
        let entries = self.read()?;
        loop {
            let id = WorkerId::from(format!(
                "worker-{}",
                self.next_id.fetch_add(1, Ordering::Relaxed)
            ));
            if entries.iter().all(|entry| entry.worker.id != id) {
                return Ok(id);
            }
        }
    }

    pub fn insert(&self, entry: WorkerEntry, max_workers: usize) -> Result<()> {
        let mut entries = self.write()?;
        if entries.iter().any(|existing| existing.worker.id == entry.worker.id) {
            return Err(SupervisorError::DuplicateWorker(entry.worker.id));
        }
        if entries.len() >= max_workers {
            return Err(SupervisorError::PoolFull(max_workers));
        }
        entries.push(entry);
        Ok(())
    }

    /// Remove a worker that is not running a job.
    pub fn remove(&self, worker_id: &WorkerId) -> Result<WorkerEntry> {
        let mut entries = self.write()?;
        let index = entries
            .iter()
            .position(|entry| &entry.worker.id == worker_id)
            .ok_or_else(|| SupervisorError::WorkerNotFound(worker_id.clone()))?;
        if entries[index].worker.current_job.is_some() {
            return Err(SupervisorError::WorkerBusy(worker_id.clone()));
        }
        Ok(entries.remove(index))
    }

    /// Remove the first idle auto-scaled worker, if any.
    pub fn remove_idle_auto_scaled(&self) -> Result<Option<WorkerEntry>> {
        let mut entries = self.write()?;
        let index = entries.iter().position(|entry| {
            entry.worker.status == WorkerStatus::Idle && entry.worker.is_auto_scaled()
        });
        Ok(index.map(|index| entries.remove(index)))
    }

    /// Reserve the best scoring idle worker able to serve `job_type` for `job_id`.
    ///
    /// Returns `None` when no worker qualifies or `max_running` jobs are already executing.
    pub fn claim(
        &self,
        job_type: &str,
        job_id: &JobId,
        max_running: usize,
        default_success_rate: f64,
    ) -> Result<Option<Claim>> {
        let mut entries = self.write()?;
        let running = entries
            .iter()
            .filter(|entry| entry.worker.status == WorkerStatus::Busy)
            .count();
        if running >= max_running {
            return Ok(None);
        }

        let mut best: Option<(usize, f64)> = None;
        for (index, entry) in entries.iter().enumerate() {
            let worker = &entry.worker;
            if worker.status != WorkerStatus::Idle || !worker.can_serve(job_type) {
                continue;
            }
            let score = worker.performance.score(default_success_rate);
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((index, score));
            }
        }

        Ok(best.map(|(index, _)| {
            let entry = &mut entries[index];
            entry.worker.status = WorkerStatus::Busy;
            entry.worker.current_job = Some(job_id.clone());
            Claim {
                worker_id: entry.worker.id.clone(),
                mailbox: entry.mailbox.clone(),
            }
        }))
    }

    /// Free the worker if it is still holding `job_id`.
    pub fn release(&self, worker_id: &WorkerId, job_id: &JobId) -> Result<bool> {
        let mut entries = self.write()?;
        Ok(find_mut(&mut entries, worker_id).is_some_and(|worker| {
            let holds_job = worker.current_job.as_ref() == Some(job_id);
            if holds_job {
                worker.current_job = None;
                if worker.status == WorkerStatus::Busy {
                    worker.status = worker.resting_status();
                }
            }
            holds_job
        }))
    }

    /// Update the worker statistics for a finished execution and free it.
    ///
    /// `success` is `None` for executions that say nothing about the worker, like cancellations.
    pub fn record_and_release(
        &self,
        worker_id: &WorkerId,
        job_id: &JobId,
        success: Option<bool>,
        duration: Duration,
    ) -> Result<bool> {
        {
            let mut entries = self.write()?;
            match find_mut(&mut entries, worker_id) {
                Some(worker) => worker.record_execution(success, duration),
                None => return Ok(false),
            }
        }
        self.release(worker_id, job_id)
    }

    /// The mailbox of a worker whose execution task has gone away.
    pub fn mark_error(&self, worker_id: &WorkerId) -> Result<Option<JobId>> {
        let mut entries = self.write()?;
        Ok(find_mut(&mut entries, worker_id).and_then(|worker| {
            worker.status = WorkerStatus::Error;
            worker.current_job.take()
        }))
    }

    /// Record a heartbeat. Returns true if the worker came back from being offline.
    pub fn heartbeat(&self, worker_id: &WorkerId) -> Result<bool> {
        let mut entries = self.write()?;
        let worker = find_mut(&mut entries, worker_id)
            .ok_or_else(|| SupervisorError::WorkerNotFound(worker_id.clone()))?;
        worker.last_heartbeat = Instant::now();
        if worker.status == WorkerStatus::Offline {
            worker.status = worker.resting_status();
            tracing::info!(%worker_id, "Worker {worker_id} is back online");
            return Ok(true);
        }
        Ok(false)
    }

    /// Mark every worker silent for longer than `stale_after` as offline.
    pub fn mark_unresponsive(&self, stale_after: Duration) -> Result<Vec<LostWorker>> {
        let mut entries = self.write()?;
        Ok(entries
            .iter_mut()
            .map(|entry| &mut entry.worker)
            .filter(|worker| {
                worker.status != WorkerStatus::Offline && worker.heartbeat_age() > stale_after
            })
            .map(|worker| {
                worker.status = WorkerStatus::Offline;
                LostWorker {
                    worker_id: worker.id.clone(),
                    job_id: worker.current_job.take(),
                }
            })
            .collect())
    }

    /// Put a worker into maintenance, right away if idle or once its job finishes.
    pub fn drain(&self, worker_id: &WorkerId) -> Result<()> {
        let mut entries = self.write()?;
        let worker = find_mut(&mut entries, worker_id)
            .ok_or_else(|| SupervisorError::WorkerNotFound(worker_id.clone()))?;
        worker.draining = true;
        if worker.status == WorkerStatus::Idle {
            worker.status = WorkerStatus::Maintenance;
        }
        Ok(())
    }

    pub fn resume(&self, worker_id: &WorkerId) -> Result<()> {
        let mut entries = self.write()?;
        let worker = find_mut(&mut entries, worker_id)
            .ok_or_else(|| SupervisorError::WorkerNotFound(worker_id.clone()))?;
        worker.draining = false;
        if worker.status == WorkerStatus::Maintenance {
            worker.status = WorkerStatus::Idle;
        }
        Ok(())
    }

    /// Recompute every worker's health and return the average, if there are any workers.
    pub fn refresh_health(&self, default_success_rate: f64) -> Result<Option<f64>> {
        let mut entries = self.write()?;
        if entries.is_empty() {
            return Ok(None);
        }
        let total: f64 = entries
            .iter_mut()
            .map(|entry| entry.worker.refresh_health(default_success_rate))
            .sum();
        Ok(Some(total / entries.len() as f64))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    pub fn busy_count(&self) -> Result<usize> {
        Ok(self
            .read()?
            .iter()
            .filter(|entry| entry.worker.status == WorkerStatus::Busy)
            .count())
    }

    /// Whether any worker that is not offline or errored can serve `job_type`.
    pub fn any_can_serve(&self, job_type: &str) -> Result<bool> {
        Ok(self.read()?.iter().any(|entry| {
            !matches!(
                entry.worker.status,
                WorkerStatus::Offline | WorkerStatus::Error
            ) && entry.worker.can_serve(job_type)
        }))
    }

    pub fn counts(&self) -> Result<HashMap<WorkerStatus, usize>> {
        let entries = self.read()?;
        let mut counts: HashMap<_, _> = WorkerStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for entry in entries.iter() {
            *counts.entry(entry.worker.status).or_default() += 1;
        }
        Ok(counts)
    }

    pub fn snapshot(&self) -> Result<Vec<Worker>> {
        Ok(self
            .read()?
            .iter()
            .map(|entry| entry.worker.clone())
            .collect())
    }
}

fn find_mut<'a>(entries: &'a mut [WorkerEntry], worker_id: &WorkerId) -> Option<&'a mut Worker> {
    entries
        .iter_mut()
        .map(|entry| &mut entry.worker)
        .find(|worker| &worker.id == worker_id)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::worker::{AUTO_SCALED_TAG, GENERAL_CAPABILITY};
    use assert_matches::assert_matches;

    /// An entry whose mailbox receiver is handed back to the test.
    pub(crate) fn detached_entry(
        id: &str,
        capabilities: &[&str],
        auto_scaled: bool,
    ) -> (WorkerEntry, mpsc::Receiver<Assignment>) {
        let (mailbox, receiver) = mpsc::channel(1);
        let tags = if auto_scaled {
            HashMap::from([(AUTO_SCALED_TAG.to_owned(), "true".to_owned())])
        } else {
            HashMap::new()
        };
        let entry = WorkerEntry {
            worker: Worker::new(id.into(), capabilities.iter().copied(), tags),
            mailbox,
            shutdown: CancellationToken::new(),
        };
        (entry, receiver)
    }

    fn table(workers: &[(&str, &[&str], bool)]) -> (WorkerTable, Vec<mpsc::Receiver<Assignment>>) {
        let table = WorkerTable::default();
        let receivers = workers
            .iter()
            .map(|(id, capabilities, auto_scaled)| {
                let (entry, receiver) = detached_entry(id, capabilities, *auto_scaled);
                table.insert(entry, 10).unwrap();
                receiver
            })
            .collect();
        (table, receivers)
    }

    fn worker(table: &WorkerTable, id: &str) -> Worker {
        table
            .snapshot()
            .unwrap()
            .into_iter()
            .find(|worker| worker.id.as_str() == id)
            .unwrap()
    }

    #[test]
    fn claim_prefers_the_first_of_equal_scores() {
        let (table, _rx) = table(&[
            ("a", &[GENERAL_CAPABILITY], false),
            ("b", &[GENERAL_CAPABILITY], false),
        ]);

        let claim = table.claim("echo", &"job".into(), 10, 0.5).unwrap().unwrap();

        assert_eq!(claim.worker_id.as_str(), "a");
        let a = worker(&table, "a");
        assert_eq!(a.status, WorkerStatus::Busy);
        assert_eq!(a.current_job, Some("job".into()));
    }

    #[test]
    fn claim_prefers_higher_scores() {
        let (table, _rx) = table(&[
            ("a", &[GENERAL_CAPABILITY], false),
            ("b", &[GENERAL_CAPABILITY], false),
        ]);
        table
            .record_and_release(&"a".into(), &"old".into(), Some(false), Duration::ZERO)
            .unwrap();

        let claim = table.claim("echo", &"job".into(), 10, 0.5).unwrap().unwrap();

        assert_eq!(claim.worker_id.as_str(), "b");
    }

    #[test]
    fn claim_respects_capabilities_and_concurrency() {
        let (table, _rx) = table(&[("a", &["echo"], false), ("b", &["echo"], false)]);

        assert!(table.claim("slow", &"j0".into(), 10, 0.5).unwrap().is_none());
        assert!(table.claim("echo", &"j1".into(), 1, 0.5).unwrap().is_some());
        assert!(table.claim("echo", &"j2".into(), 1, 0.5).unwrap().is_none());
    }

    #[test]
    fn busy_if_and_only_if_holding_a_job() {
        let (table, _rx) = table(&[("a", &[GENERAL_CAPABILITY], false)]);
        let job = JobId::from("job");
        table.claim("echo", &job, 10, 0.5).unwrap().unwrap();

        assert!(!table.release(&"a".into(), &"other".into()).unwrap());
        assert_eq!(worker(&table, "a").status, WorkerStatus::Busy);

        assert!(table
            .record_and_release(&"a".into(), &job, Some(true), Duration::from_millis(10))
            .unwrap());
        let a = worker(&table, "a");
        assert_eq!(a.status, WorkerStatus::Idle);
        assert_eq!(a.current_job, None);
        assert_eq!(a.jobs_processed, 1);
    }

    #[test]
    fn draining_worker_rests_in_maintenance() {
        let (table, _rx) = table(&[("a", &[GENERAL_CAPABILITY], false)]);
        let job = JobId::from("job");
        table.claim("echo", &job, 10, 0.5).unwrap().unwrap();

        table.drain(&"a".into()).unwrap();
        assert_eq!(worker(&table, "a").status, WorkerStatus::Busy);
        table.release(&"a".into(), &job).unwrap();
        assert_eq!(worker(&table, "a").status, WorkerStatus::Maintenance);
        assert!(table.claim("echo", &"next".into(), 10, 0.5).unwrap().is_none());

        table.resume(&"a".into()).unwrap();
        assert_eq!(worker(&table, "a").status, WorkerStatus::Idle);
    }

    #[test]
    fn only_idle_auto_scaled_workers_are_removed() {
        let (table, _rx) = table(&[
            ("manual", &[GENERAL_CAPABILITY], false),
            ("busy", &[GENERAL_CAPABILITY], true),
            ("spare", &[GENERAL_CAPABILITY], true),
        ]);
        table
            .claim("echo", &"job".into(), 10, 0.5)
            .unwrap()
            .unwrap();
        // The manual worker took the job, so occupy the first auto-scaled one too.
        table
            .claim("echo", &"job2".into(), 10, 0.5)
            .unwrap()
            .unwrap();

        let removed = table.remove_idle_auto_scaled().unwrap().unwrap();
        assert_eq!(removed.worker.id.as_str(), "spare");
        assert!(table.remove_idle_auto_scaled().unwrap().is_none());
    }

    #[test]
    fn only_live_workers_count_as_able_to_serve() {
        let (table, _rx) = table(&[("a", &["echo"], false), ("b", &["report"], false)]);
        assert!(table.any_can_serve("echo").unwrap());
        assert!(!table.any_can_serve("resize").unwrap());

        table.claim("echo", &"job".into(), 10, 0.5).unwrap().unwrap();
        assert!(table.any_can_serve("echo").unwrap());

        table.mark_error(&"a".into()).unwrap();
        assert!(!table.any_can_serve("echo").unwrap());
        assert!(table.any_can_serve("report").unwrap());
    }

    #[test]
    fn busy_workers_cannot_be_removed() {
        let (table, _rx) = table(&[("a", &[GENERAL_CAPABILITY], false)]);
        table.claim("echo", &"job".into(), 10, 0.5).unwrap().unwrap();

        assert_matches!(
            table.remove(&"a".into()).map(|_| ()),
            Err(SupervisorError::WorkerBusy(_))
        );
        assert_matches!(
            table.remove(&"missing".into()).map(|_| ()),
            Err(SupervisorError::WorkerNotFound(_))
        );
    }

    #[test]
    fn pool_size_is_bounded() {
        let table = WorkerTable::default();
        let (first, _rx1) = detached_entry("a", &[GENERAL_CAPABILITY], false);
        let (second, _rx2) = detached_entry("b", &[GENERAL_CAPABILITY], false);
        let (duplicate, _rx3) = detached_entry("a", &[GENERAL_CAPABILITY], false);

        table.insert(first, 1).unwrap();
        assert_matches!(
            table.insert(duplicate, 2),
            Err(SupervisorError::DuplicateWorker(_))
        );
        assert_matches!(table.insert(second, 1), Err(SupervisorError::PoolFull(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_workers_go_offline_and_recover_on_heartbeat() {
        let (table, _rx) = table(&[
            ("silent", &[GENERAL_CAPABILITY], false),
            ("alive", &[GENERAL_CAPABILITY], false),
        ]);
        let job = JobId::from("job");
        table.claim("echo", &job, 10, 0.5).unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        table.heartbeat(&"alive".into()).unwrap();

        let lost = table.mark_unresponsive(Duration::from_secs(3)).unwrap();
        assert_eq!(
            lost,
            [LostWorker {
                worker_id: "silent".into(),
                job_id: Some(job),
            }]
        );
        let silent = worker(&table, "silent");
        assert_eq!(silent.status, WorkerStatus::Offline);
        assert_eq!(silent.current_job, None);

        assert!(table.mark_unresponsive(Duration::from_secs(3)).unwrap().is_empty());

        assert!(table.heartbeat(&"silent".into()).unwrap());
        assert_eq!(worker(&table, "silent").status, WorkerStatus::Idle);
    }

    #[test]
    fn generated_ids_skip_taken_ones() {
        let (table, _rx) = table(&[("worker-0", &[GENERAL_CAPABILITY], false)]);
        assert_eq!(table.generate_id().unwrap().as_str(), "worker-1");
    }
}
