//! Grows and shrinks the worker pool with the load.
//!
//! The load factor weighs busy workers against the pool size and adds a share for the queue
//! backlog. Above the high threshold a general, auto-scaled worker is added; below the low
//! threshold one idle auto-scaled worker is removed. Manually added workers are never removed.
//! Scale-up and scale-down have independent cooldowns.
use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::time::{Instant, MissedTickBehavior};

use crate::{
    shared::Shared,
    worker::{AUTO_SCALED_TAG, GENERAL_CAPABILITY},
    SupervisorError,
};

/// Queue length that on its own contributes the full queue share of the load factor.
const QUEUE_SATURATION: f64 = 100.0;

/// `0.7 * active / workers + 0.3 * queued / 100`, clamped to `[0, 1]`.
///
/// A pool without workers is fully loaded.
pub(crate) fn load_factor(active_jobs: usize, workers: usize, queued: usize) -> f64 {
    if workers == 0 {
        return 1.0;
    }
    let load = 0.7 * active_jobs as f64 / workers as f64 + 0.3 * queued as f64 / QUEUE_SATURATION;
    load.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScalingDecision {
    ScaleUp,
    ScaleDown,
    Hold,
}

pub(crate) struct AutoScaler {
    shared: Arc<Shared>,
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
}

impl AutoScaler {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            last_scale_up: None,
            last_scale_down: None,
        }
    }

    pub fn spawn(self) {
        let tracker = self.shared.tracker.clone();
        tracker.spawn(self.run());
    }

    async fn run(mut self) {
        let period = self.shared.config.auto_scale_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let _ = self.check().inspect_err(|err| {
                        tracing::error!(?err, "Auto-scaling check failed: {err}")
                    });
                }
                _ = self.shared.cancellation.cancelled() => break,
            }
        }
        tracing::debug!("Shutting down the auto-scaler");
    }

    pub(crate) fn check(&mut self) -> Result<ScalingDecision, SupervisorError> {
        let decision = self.decide()?;
        match decision {
            ScalingDecision::ScaleUp => self.scale_up()?,
            ScalingDecision::ScaleDown => self.scale_down()?,
            ScalingDecision::Hold => {}
        }
        Ok(decision)
    }

    fn decide(&self) -> Result<ScalingDecision, SupervisorError> {
        let config = &self.shared.config;
        let workers = self.shared.workers.len()?;
        let load = load_factor(
            self.shared.workers.busy_count()?,
            workers,
            self.shared.queue.depth(),
        );
        tracing::trace!(load, workers, "Sampled load factor");

        if load > config.high_load_threshold
            && workers < config.max_workers
            && cooled_down(self.last_scale_up, config.scale_up_cooldown)
        {
            return Ok(ScalingDecision::ScaleUp);
        }
        if load < config.low_load_threshold
            && workers > config.min_workers
            && cooled_down(self.last_scale_down, config.scale_down_cooldown)
        {
            return Ok(ScalingDecision::ScaleDown);
        }
        Ok(ScalingDecision::Hold)
    }

    fn scale_up(&mut self) -> Result<(), SupervisorError> {
        let tags = HashMap::from([(AUTO_SCALED_TAG.to_owned(), "true".to_owned())]);
        let worker_id = self.shared.spawn_worker(None, [GENERAL_CAPABILITY], tags)?;
        self.last_scale_up = Some(Instant::now());
        tracing::info!(%worker_id, "Scaled up, added worker {worker_id}");
        Ok(())
    }

    fn scale_down(&mut self) -> Result<(), SupervisorError> {
        match self.shared.workers.remove_idle_auto_scaled()? {
            Some(entry) => {
                entry.shutdown.cancel();
                self.last_scale_down = Some(Instant::now());
                let worker_id = entry.worker.id;
                tracing::info!(%worker_id, "Scaled down, removed worker {worker_id}");
            }
            None => tracing::debug!("Low load but no idle auto-scaled worker to remove"),
        }
        Ok(())
    }
}

fn cooled_down(last: Option<Instant>, cooldown: Duration) -> bool {
    last.map_or(true, |last| last.elapsed() >= cooldown)
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::sync::mpsc;

    use crate::{
        config::SupervisorConfig,
        worker::{runner::Assignment, table::test::detached_entry, WorkerStatus},
    };

    fn autoscaler(config: SupervisorConfig) -> AutoScaler {
        let (shared, _queue, _results) = Shared::new(config);
        AutoScaler::new(Arc::new(shared))
    }

    fn add_detached(
        scaler: &AutoScaler,
        id: &str,
        auto_scaled: bool,
    ) -> mpsc::Receiver<Assignment> {
        let (entry, mailbox) = detached_entry(id, &[GENERAL_CAPABILITY], auto_scaled);
        scaler
            .shared
            .workers
            .insert(entry, scaler.shared.config.max_workers)
            .unwrap();
        mailbox
    }

    fn occupy_all(scaler: &AutoScaler) {
        let mut n = 0;
        while scaler
            .shared
            .workers
            .claim("echo", &format!("job-{n}").into(), usize::MAX, 0.5)
            .unwrap()
            .is_some()
        {
            n += 1;
        }
    }

    #[test]
    fn load_factor_formula() {
        assert_eq!(load_factor(0, 0, 0), 1.0);
        assert_eq!(load_factor(0, 4, 0), 0.0);
        assert!((load_factor(2, 4, 0) - 0.35).abs() < 1e-9);
        assert!((load_factor(4, 4, 50) - 0.85).abs() < 1e-9);
        assert_eq!(load_factor(4, 4, 1000), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn scales_up_under_load_within_bounds_and_cooldown() {
        let config = SupervisorConfig::default()
            .with_workers(1, 3)
            .with_auto_scaling(0.2, 0.5)
            .with_scale_cooldowns(Duration::from_secs(60), Duration::from_secs(60));
        let mut scaler = autoscaler(config);
        let _manual = add_detached(&scaler, "manual", false);
        occupy_all(&scaler);

        assert_eq!(scaler.check().unwrap(), ScalingDecision::ScaleUp);
        assert_eq!(scaler.shared.workers.len().unwrap(), 2);
        let added = scaler.shared.workers.snapshot().unwrap().pop().unwrap();
        assert!(added.is_auto_scaled());
        assert!(added.can_serve("anything"));

        occupy_all(&scaler);
        assert_eq!(scaler.check().unwrap(), ScalingDecision::Hold);

        tokio::time::advance(Duration::from_secs(60)).await;
        occupy_all(&scaler);
        assert_eq!(scaler.check().unwrap(), ScalingDecision::ScaleUp);
        assert_eq!(scaler.shared.workers.len().unwrap(), 3);

        tokio::time::advance(Duration::from_secs(60)).await;
        occupy_all(&scaler);
        assert_eq!(scaler.check().unwrap(), ScalingDecision::Hold);
        assert_eq!(scaler.shared.workers.len().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn scales_down_only_idle_auto_scaled_workers_and_not_below_min() {
        let config = SupervisorConfig::default()
            .with_workers(1, 5)
            .with_scale_cooldowns(Duration::from_secs(60), Duration::from_secs(60));
        let mut scaler = autoscaler(config);
        let _manual_1 = add_detached(&scaler, "manual-1", false);
        let _manual_2 = add_detached(&scaler, "manual-2", false);
        let _auto = add_detached(&scaler, "auto-1", true);

        assert_eq!(scaler.check().unwrap(), ScalingDecision::ScaleDown);
        let ids: Vec<_> = scaler
            .shared
            .workers
            .snapshot()
            .unwrap()
            .into_iter()
            .map(|worker| worker.id.to_string())
            .collect();
        assert_eq!(ids, ["manual-1", "manual-2"]);

        tokio::time::advance(Duration::from_secs(60)).await;
        // Low load persists, but only manual workers remain.
        assert_eq!(scaler.check().unwrap(), ScalingDecision::ScaleDown);
        assert_eq!(scaler.shared.workers.len().unwrap(), 2);
        assert!(scaler
            .shared
            .workers
            .snapshot()
            .unwrap()
            .iter()
            .all(|worker| worker.status == WorkerStatus::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn holds_at_min_workers() {
        let config = SupervisorConfig::default().with_workers(1, 5);
        let mut scaler = autoscaler(config);
        let _auto = add_detached(&scaler, "auto-1", true);

        assert_eq!(scaler.check().unwrap(), ScalingDecision::Hold);
        assert_eq!(scaler.shared.workers.len().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scale_down_cooldown_is_independent_of_scale_up() {
        let config = SupervisorConfig::default()
            .with_workers(0, 5)
            .with_scale_cooldowns(Duration::from_secs(10), Duration::from_secs(600));
        let mut scaler = autoscaler(config);
        let _auto_1 = add_detached(&scaler, "auto-1", true);
        let _auto_2 = add_detached(&scaler, "auto-2", true);

        assert_eq!(scaler.check().unwrap(), ScalingDecision::ScaleDown);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(scaler.check().unwrap(), ScalingDecision::Hold);
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(scaler.check().unwrap(), ScalingDecision::ScaleDown);
        assert_eq!(scaler.shared.workers.len().unwrap(), 0);
    }
}
