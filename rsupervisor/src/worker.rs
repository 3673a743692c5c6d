//! Workers: the logical execution slots of the pool.
//!
//! Every worker is backed by its own tokio task (see `worker::runner`) that receives one job at a
//! time, executes it and heartbeats while alive. The [`Worker`] struct is the bookkeeping the
//! supervisor keeps about it; callers see clones through [`crate::Supervisor::worker_status`].
use std::{
    collections::{BTreeSet, HashMap},
    fmt::Display,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::job::JobId;

pub(crate) mod runner;
pub(crate) mod table;

/// The capability that lets a worker serve any job type.
pub const GENERAL_CAPABILITY: &str = "general";
/// Tag set on workers created by the auto-scaler.
pub const AUTO_SCALED_TAG: &str = "auto_scaled";

const EMA_ALPHA: f64 = 0.1;
const ACTIVITY_DECAY: Duration = Duration::from_secs(24 * 60 * 60);

/// The unique identifier of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
    Maintenance,
    Error,
}

impl WorkerStatus {
    pub const ALL: [WorkerStatus; 5] = [
        Self::Idle,
        Self::Busy,
        Self::Offline,
        Self::Maintenance,
        Self::Error,
    ];
}

impl Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Offline => "offline",
            Self::Maintenance => "maintenance",
            Self::Error => "error",
        };
        f.write_str(status)
    }
}

/// Rolling statistics used to score a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerPerformance {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    /// Exponential moving average of the execution time.
    pub avg_task_time: Duration,
}

impl WorkerPerformance {
    /// The share of successful jobs, or `default` without any history.
    pub fn success_rate(&self, default: f64) -> f64 {
        let total = self.jobs_completed + self.jobs_failed;
        if total == 0 {
            default
        } else {
            self.jobs_completed as f64 / total as f64
        }
    }

    /// Approaches 1 for fast workers and 0 for slow ones.
    pub fn speed_score(&self) -> f64 {
        1.0 / (1.0 + self.avg_task_time.as_secs_f64() / 60.0)
    }

    pub fn score(&self, default_success_rate: f64) -> f64 {
        0.7 * self.success_rate(default_success_rate) + 0.3 * self.speed_score()
    }

    fn record(&mut self, success: bool, duration: Duration) {
        let samples = self.jobs_completed + self.jobs_failed;
        if success {
            self.jobs_completed += 1;
        } else {
            self.jobs_failed += 1;
        }
        self.avg_task_time = if samples == 0 {
            duration
        } else {
            self.avg_task_time.mul_f64(1.0 - EMA_ALPHA) + duration.mul_f64(EMA_ALPHA)
        };
    }
}

/// The supervisor's view of a worker.
#[derive(Debug, Clone, Serialize)]
pub struct Worker {
    pub id: WorkerId,
    pub capabilities: BTreeSet<String>,
    pub status: WorkerStatus,
    pub current_job: Option<JobId>,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    pub last_heartbeat: Instant,
    #[serde(skip)]
    pub last_activity: Instant,
    pub jobs_processed: u64,
    pub errors_count: u64,
    pub performance: WorkerPerformance,
    /// Decays from 1 to 0 over a day without activity.
    pub load_factor: f64,
    pub health_score: f64,
    pub tags: HashMap<String, String>,
    /// Set while the worker is being drained into maintenance.
    pub draining: bool,
}

impl Worker {
    pub(crate) fn new(
        id: WorkerId,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        tags: HashMap<String, String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            status: WorkerStatus::Idle,
            current_job: None,
            started_at: Utc::now(),
            last_heartbeat: now,
            last_activity: now,
            jobs_processed: 0,
            errors_count: 0,
            performance: WorkerPerformance::default(),
            load_factor: 1.0,
            health_score: 1.0,
            tags,
            draining: false,
        }
    }

    /// Whether the worker may serve jobs of the given type.
    pub fn can_serve(&self, job_type: &str) -> bool {
        self.capabilities.contains(job_type) || self.capabilities.contains(GENERAL_CAPABILITY)
    }

    pub fn is_auto_scaled(&self) -> bool {
        self.tags.get(AUTO_SCALED_TAG).is_some_and(|value| value == "true")
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.elapsed()
    }

    /// The status a worker returns to when it has nothing to do.
    pub(crate) fn resting_status(&self) -> WorkerStatus {
        if self.draining {
            WorkerStatus::Maintenance
        } else {
            WorkerStatus::Idle
        }
    }

    pub(crate) fn record_execution(&mut self, outcome: Option<bool>, duration: Duration) {
        self.jobs_processed += 1;
        self.last_activity = Instant::now();
        if let Some(success) = outcome {
            if !success {
                self.errors_count += 1;
            }
            self.performance.record(success, duration);
        }
    }

    pub(crate) fn refresh_health(&mut self, default_success_rate: f64) -> f64 {
        let idle_for = self.last_activity.elapsed();
        self.load_factor =
            (1.0 - idle_for.as_secs_f64() / ACTIVITY_DECAY.as_secs_f64()).clamp(0.0, 1.0);
        self.health_score =
            0.7 * self.performance.success_rate(default_success_rate) + 0.3 * self.load_factor;
        self.health_score
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn worker(capabilities: &[&str]) -> Worker {
        Worker::new("w".into(), capabilities.iter().copied(), HashMap::new())
    }

    #[test]
    fn capability_matching() {
        assert!(worker(&["echo"]).can_serve("echo"));
        assert!(!worker(&["echo"]).can_serve("slow"));
        assert!(worker(&[GENERAL_CAPABILITY]).can_serve("slow"));
    }

    #[test]
    fn new_workers_use_default_success_rate() {
        let performance = WorkerPerformance::default();
        assert_eq!(performance.success_rate(0.5), 0.5);
        assert_eq!(performance.speed_score(), 1.0);
        assert!((performance.score(0.5) - 0.65).abs() < 1e-9);
    }

    #[test]
    fn first_sample_sets_the_average() {
        let mut performance = WorkerPerformance::default();
        performance.record(true, Duration::from_secs(10));
        assert_eq!(performance.avg_task_time, Duration::from_secs(10));
    }

    #[test]
    fn moving_average_weights_new_samples_by_alpha() {
        let mut performance = WorkerPerformance::default();
        performance.record(true, Duration::from_secs(10));
        performance.record(false, Duration::from_secs(20));

        let avg = performance.avg_task_time.as_secs_f64();
        assert!((avg - 11.0).abs() < 1e-6, "{avg}");
        assert_eq!(performance.success_rate(0.5), 0.5);
    }

    #[test]
    fn slower_workers_score_lower() {
        let mut fast = WorkerPerformance::default();
        fast.record(true, Duration::from_secs(1));
        let mut slow = WorkerPerformance::default();
        slow.record(true, Duration::from_secs(120));

        assert!(fast.score(0.5) > slow.score(0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn load_factor_decays_with_inactivity() {
        let mut worker = worker(&[GENERAL_CAPABILITY]);
        assert_eq!(worker.refresh_health(0.5), 0.7 * 0.5 + 0.3);

        tokio::time::advance(ACTIVITY_DECAY / 2).await;
        worker.refresh_health(0.5);
        assert!((worker.load_factor - 0.5).abs() < 1e-6);

        tokio::time::advance(ACTIVITY_DECAY).await;
        assert_eq!(worker.refresh_health(0.5), 0.7 * 0.5);
    }

    #[test]
    fn auto_scaled_tag() {
        let mut worker = worker(&[GENERAL_CAPABILITY]);
        assert!(!worker.is_auto_scaled());
        worker
            .tags
            .insert(AUTO_SCALED_TAG.to_owned(), "true".to_owned());
        assert!(worker.is_auto_scaled());
    }
}
