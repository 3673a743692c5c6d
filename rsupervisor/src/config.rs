//! Configuration for the [`crate::Supervisor`].
//!
//! All fields are public and have sensible defaults, so a config is usually built by updating
//! [`SupervisorConfig::default`] either with struct update syntax or the `with_*` methods.
//!
//! The config derives [`serde::Deserialize`] with `#[serde(default)]`, meaning a host application
//! can load a partial document and have the remaining fields filled in.
//!
//! # Example
//!
//! ```
//! # use rsupervisor::config::SupervisorConfig;
//! # use std::time::Duration;
//! let config = SupervisorConfig::default()
//!     .with_workers(2, 8)
//!     .with_job_timeout(Duration::from_secs(30))
//!     .with_retries(2, Duration::from_secs(1))
//!     .with_circuit_breaker(3, Duration::from_secs(10));
//!
//! assert!(config.validate().is_ok());
//! ```
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SupervisorError;

/// Tunables for the supervisor, its worker pool and its background loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// The maximum number of jobs executing at the same time across all workers.
    pub max_concurrent_jobs: usize,
    /// Upper bound for the execution time of any job.
    ///
    /// A job's own timeout can only shorten this.
    pub job_timeout: Duration,
    /// How often workers heartbeat and the health checker runs.
    ///
    /// Workers silent for more than three intervals are marked offline.
    pub health_check_interval: Duration,
    /// The retry budget for jobs that do not set their own.
    pub retry_attempts: u32,
    /// The base delay between retries, multiplied by the retry count.
    pub retry_backoff: Duration,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Load factor above which the auto-scaler adds a worker.
    pub high_load_threshold: f64,
    /// Load factor below which the auto-scaler removes an idle auto-scaled worker.
    pub low_load_threshold: f64,
    /// Consecutive failures after which the circuit breaker opens.
    pub circuit_breaker_threshold: u32,
    /// How long the circuit breaker stays open before letting a probe through.
    pub circuit_breaker_timeout: Duration,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
    pub enable_auto_scaling: bool,
    pub enable_circuit_breaker: bool,
    /// How often the auto-scaler samples the load factor.
    pub auto_scale_interval: Duration,
    /// Capacity of the job queue between submission and the dispatcher.
    pub queue_capacity: usize,
    /// Capacity of the queue carrying execution results to the result processor.
    pub result_queue_capacity: usize,
    /// How long the dispatcher holds a job when no worker can take it.
    pub dispatch_retry_delay: Duration,
    /// How long finished jobs remain queryable.
    pub job_retention: Duration,
    /// The success rate assumed for workers that have not finished any job yet.
    pub new_worker_success_rate: f64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            job_timeout: Duration::from_secs(5 * 60),
            health_check_interval: Duration::from_secs(30),
            retry_attempts: 3,
            retry_backoff: Duration::from_secs(5),
            min_workers: 2,
            max_workers: 10,
            high_load_threshold: 0.8,
            low_load_threshold: 0.2,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
            scale_up_cooldown: Duration::from_secs(2 * 60),
            scale_down_cooldown: Duration::from_secs(5 * 60),
            enable_auto_scaling: true,
            enable_circuit_breaker: true,
            auto_scale_interval: Duration::from_secs(60),
            queue_capacity: 1000,
            result_queue_capacity: 1000,
            dispatch_retry_delay: Duration::from_secs(1),
            job_retention: Duration::from_secs(24 * 60 * 60),
            new_worker_success_rate: 0.5,
        }
    }
}

impl SupervisorConfig {
    /// Set the bounds of the worker pool.
    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, limit: usize) -> Self {
        self.max_concurrent_jobs = limit;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the default retry budget and the linear backoff base.
    pub fn with_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_backoff = backoff;
        self
    }

    /// Enable the circuit breaker with the given threshold and open duration.
    pub fn with_circuit_breaker(mut self, threshold: u32, timeout: Duration) -> Self {
        self.enable_circuit_breaker = true;
        self.circuit_breaker_threshold = threshold;
        self.circuit_breaker_timeout = timeout;
        self
    }

    pub fn without_circuit_breaker(mut self) -> Self {
        self.enable_circuit_breaker = false;
        self
    }

    /// Enable auto-scaling between the given load thresholds.
    pub fn with_auto_scaling(mut self, low: f64, high: f64) -> Self {
        self.enable_auto_scaling = true;
        self.low_load_threshold = low;
        self.high_load_threshold = high;
        self
    }

    pub fn without_auto_scaling(mut self) -> Self {
        self.enable_auto_scaling = false;
        self
    }

    pub fn with_scale_cooldowns(mut self, up: Duration, down: Duration) -> Self {
        self.scale_up_cooldown = up;
        self.scale_down_cooldown = down;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_dispatch_retry_delay(mut self, delay: Duration) -> Self {
        self.dispatch_retry_delay = delay;
        self
    }

    pub fn with_job_retention(mut self, retention: Duration) -> Self {
        self.job_retention = retention;
        self
    }

    /// Check the config for values the supervisor cannot run with.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        let invalid = |msg: &str| Err(SupervisorError::InvalidConfig(msg.to_owned()));

        if self.max_concurrent_jobs == 0 {
            return invalid("max concurrent jobs must be positive");
        }
        if self.job_timeout.is_zero() {
            return invalid("job timeout must be positive");
        }
        if self.health_check_interval.is_zero() {
            return invalid("health check interval must be positive");
        }
        if self.max_workers == 0 {
            return invalid("max workers must be positive");
        }
        if self.min_workers > self.max_workers {
            return invalid("min workers must not exceed max workers");
        }
        let in_unit_range = |value: f64| (0.0..=1.0).contains(&value);
        if !in_unit_range(self.low_load_threshold) || !in_unit_range(self.high_load_threshold) {
            return invalid("load thresholds must be between 0 and 1");
        }
        if self.low_load_threshold >= self.high_load_threshold {
            return invalid("low load threshold must be below the high load threshold");
        }
        if !in_unit_range(self.new_worker_success_rate) {
            return invalid("new worker success rate must be between 0 and 1");
        }
        if self.queue_capacity == 0 || self.result_queue_capacity == 0 {
            return invalid("queue capacities must be positive");
        }
        if self.dispatch_retry_delay.is_zero() {
            return invalid("dispatch retry delay must be positive");
        }
        if self.enable_circuit_breaker && self.circuit_breaker_threshold == 0 {
            return invalid("circuit breaker threshold must be positive");
        }
        if self.enable_auto_scaling && self.auto_scale_interval.is_zero() {
            return invalid("auto scale interval must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn default_is_valid() {
        assert!(SupervisorConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_required_values() {
        let cases = [
            (
                SupervisorConfig::default().with_max_concurrent_jobs(0),
                "max concurrent jobs must be positive",
            ),
            (
                SupervisorConfig::default().with_job_timeout(Duration::ZERO),
                "job timeout must be positive",
            ),
            (
                SupervisorConfig::default().with_health_check_interval(Duration::ZERO),
                "health check interval must be positive",
            ),
        ];

        for (config, expected) in cases {
            assert_matches!(
                config.validate(),
                Err(SupervisorError::InvalidConfig(msg)) if msg == expected
            );
        }
    }

    #[test]
    fn rejects_inverted_bounds() {
        assert_matches!(
            SupervisorConfig::default().with_workers(5, 2).validate(),
            Err(SupervisorError::InvalidConfig(_))
        );
        assert_matches!(
            SupervisorConfig::default()
                .with_auto_scaling(0.9, 0.1)
                .validate(),
            Err(SupervisorError::InvalidConfig(_))
        );
    }

    #[test]
    fn zero_breaker_threshold_only_matters_when_enabled() {
        let config = SupervisorConfig {
            circuit_breaker_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(config.without_circuit_breaker().validate().is_ok());
    }

    #[test]
    fn partial_documents_fill_in_defaults() {
        let config: SupervisorConfig =
            serde_json::from_str(r#"{"max_concurrent_jobs": 3, "min_workers": 1}"#).unwrap();

        assert_eq!(config.max_concurrent_jobs, 3);
        assert_eq!(config.min_workers, 1);
        assert_eq!(config.job_timeout, SupervisorConfig::default().job_timeout);
    }
}
