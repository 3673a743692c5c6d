//! A fail-fast guard shared by every worker.
//!
//! The breaker counts consecutive failures of protected handlers. Once the count reaches the
//! threshold the breaker opens and jobs for protected handlers fail immediately with
//! [`CIRCUIT_OPEN_MESSAGE`]. After the timeout has elapsed since the last failure the breaker lets
//! the next caller through as a probe: a success closes it again, a failure re-opens it.
use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::SupervisorError;

pub const CIRCUIT_OPEN_MESSAGE: &str = "circuit breaker is open";

/// The observable state of a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Contribution of the breaker to the supervisor health score.
    pub fn health(self) -> f64 {
        match self {
            Self::Closed => 1.0,
            Self::HalfOpen => 0.5,
            Self::Open => 0.0,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            threshold,
            timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, SupervisorError> {
        self.inner.lock().map_err(|_| SupervisorError::BadState)
    }

    /// Whether callers should be rejected right now.
    ///
    /// An open breaker whose timeout has elapsed moves to half-open and reports itself as closed
    /// so the caller can act as the probe.
    pub fn is_open(&self) -> Result<bool, SupervisorError> {
        let mut inner = self.lock()?;
        if inner.state == CircuitState::Open {
            let elapsed = inner.last_failure.map_or(Duration::MAX, |at| at.elapsed());
            if elapsed >= self.timeout {
                tracing::info!("Circuit breaker timeout elapsed, allowing a probe");
                inner.state = CircuitState::HalfOpen;
            }
        }
        Ok(inner.state == CircuitState::Open)
    }

    pub fn record_success(&self) -> Result<(), SupervisorError> {
        let mut inner = self.lock()?;
        if inner.state != CircuitState::Closed {
            tracing::info!("Circuit breaker closed");
        }
        inner.failure_count = 0;
        inner.state = CircuitState::Closed;
        Ok(())
    }

    pub fn record_failure(&self) -> Result<(), SupervisorError> {
        let mut inner = self.lock()?;
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        let should_open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failure_count >= self.threshold,
            CircuitState::Open => false,
        };
        if should_open {
            tracing::warn!(
                failure_count = inner.failure_count,
                "Circuit breaker opened after {} consecutive failures",
                inner.failure_count
            );
            inner.state = CircuitState::Open;
        }
        Ok(())
    }

    pub fn state(&self) -> Result<CircuitState, SupervisorError> {
        Ok(self.lock()?.state)
    }

    pub fn failure_count(&self) -> Result<u32, SupervisorError> {
        Ok(self.lock()?.failure_count)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, TIMEOUT);

        breaker.record_failure().unwrap();
        breaker.record_failure().unwrap();
        assert!(!breaker.is_open().unwrap());

        breaker.record_failure().unwrap();
        assert!(breaker.is_open().unwrap());
        assert_eq!(breaker.state().unwrap(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_count() {
        let breaker = CircuitBreaker::new(3, TIMEOUT);

        breaker.record_failure().unwrap();
        breaker.record_failure().unwrap();
        breaker.record_success().unwrap();
        breaker.record_failure().unwrap();

        assert!(!breaker.is_open().unwrap());
        assert_eq!(breaker.failure_count().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_success_after_timeout_closes() {
        let breaker = CircuitBreaker::new(2, TIMEOUT);
        breaker.record_failure().unwrap();
        breaker.record_failure().unwrap();
        assert!(breaker.is_open().unwrap());

        tokio::time::advance(TIMEOUT).await;

        assert!(!breaker.is_open().unwrap());
        assert_eq!(breaker.state().unwrap(), CircuitState::HalfOpen);
        breaker.record_success().unwrap();
        assert_eq!(breaker.state().unwrap(), CircuitState::Closed);
        assert!(!breaker.is_open().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_reopens() {
        let breaker = CircuitBreaker::new(2, TIMEOUT);
        breaker.record_failure().unwrap();
        breaker.record_failure().unwrap();

        tokio::time::advance(TIMEOUT).await;
        assert!(!breaker.is_open().unwrap());

        breaker.record_failure().unwrap();
        assert!(breaker.is_open().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn stays_open_before_timeout() {
        let breaker = CircuitBreaker::new(1, TIMEOUT);
        breaker.record_failure().unwrap();

        tokio::time::advance(TIMEOUT / 2).await;

        assert!(breaker.is_open().unwrap());
    }

    #[test]
    fn health_by_state() {
        assert_eq!(CircuitState::Closed.health(), 1.0);
        assert_eq!(CircuitState::HalfOpen.health(), 0.5);
        assert_eq!(CircuitState::Open.health(), 0.0);
    }
}
