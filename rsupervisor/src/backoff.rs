//! Backoff strategies deciding how long a failed job waits before it is retried.
//!
//! Three growth curves are available:
//!
//! 1. Constant
//! 2. Linear (the supervisor default, `retry_backoff * retry_count`)
//! 3. Exponential
//!
//! each of which can be capped with [`BackoffStrategy::with_max`], floored with
//! [`BackoffStrategy::with_min`] and blurred with [`Jitter`].
//!
//! All of the constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use rsupervisor::backoff::{BackoffStrategy, Jitter};
//! # use std::time::Duration;
//! let strategy = BackoffStrategy::linear(Duration::from_secs(20))
//!     .with_max(Duration::from_secs(60))
//!     .with_jitter(Jitter::Absolute(Duration::from_secs(10)));
//!
//! assert!(strategy.backoff(1) >= Duration::from_secs(10));
//! assert!(strategy.backoff(1) <= Duration::from_secs(30));
//! // The max is applied before the jitter
//! assert!(strategy.backoff(10) >= Duration::from_secs(50));
//! assert!(strategy.backoff(10) <= Duration::from_secs(70));
//! ```
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Growth {
    Constant,
    Linear,
    Exponential,
}

/// Jitter applied on top of a computed backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Add or subtract up to this duration.
    Absolute(Duration),
    /// Add or subtract up to this fraction of the computed backoff.
    Relative(f64),
}

impl Jitter {
    fn apply(self, delay: Duration) -> Duration {
        let spread = match self {
            Self::Absolute(spread) => spread,
            Self::Relative(fraction) => {
                Duration::try_from_secs_f64(delay.as_secs_f64() * fraction.clamp(0.0, 1.0))
                    .unwrap_or(Duration::MAX)
            }
        };
        let spread_ms = spread.as_millis().min(u64::MAX as u128) as u64;
        if spread_ms == 0 {
            return delay;
        }
        let offset = rand::thread_rng().gen_range(0..=spread_ms.saturating_mul(2));
        delay
            .saturating_add(Duration::from_millis(offset))
            .saturating_sub(spread)
    }
}

/// How long to wait before the `retry_count`-th retry of a job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy {
    growth: Growth,
    base: Duration,
    min: Duration,
    max: Option<Duration>,
    jitter: Option<Jitter>,
}

impl BackoffStrategy {
    const fn new(growth: Growth, base: Duration) -> Self {
        Self {
            growth,
            base,
            min: Duration::ZERO,
            max: None,
            jitter: None,
        }
    }

    /// Always wait `delay`.
    ///
    /// ```
    /// # use rsupervisor::backoff::BackoffStrategy;
    /// # use std::time::Duration;
    /// let strategy = BackoffStrategy::constant(Duration::from_secs(10));
    ///
    /// assert_eq!(strategy.backoff(1), Duration::from_secs(10));
    /// assert_eq!(strategy.backoff(3), Duration::from_secs(10));
    /// ```
    pub const fn constant(delay: Duration) -> Self {
        Self::new(Growth::Constant, delay)
    }

    /// Wait `factor * retry_count`.
    ///
    /// ```
    /// # use rsupervisor::backoff::BackoffStrategy;
    /// # use std::time::Duration;
    /// let strategy =
    ///     BackoffStrategy::linear(Duration::from_secs(10)).with_max(Duration::from_secs(25));
    ///
    /// assert_eq!(strategy.backoff(1), Duration::from_secs(10));
    /// assert_eq!(strategy.backoff(2), Duration::from_secs(20));
    /// assert_eq!(strategy.backoff(3), Duration::from_secs(25));
    /// ```
    pub const fn linear(factor: Duration) -> Self {
        Self::new(Growth::Linear, factor)
    }

    /// Wait `base * 2^(retry_count - 1)`.
    ///
    /// ```
    /// # use rsupervisor::backoff::BackoffStrategy;
    /// # use std::time::Duration;
    /// let strategy =
    ///     BackoffStrategy::exponential(Duration::from_secs(2)).with_max(Duration::from_secs(30));
    ///
    /// assert_eq!(strategy.backoff(1), Duration::from_secs(2));
    /// assert_eq!(strategy.backoff(2), Duration::from_secs(4));
    /// assert_eq!(strategy.backoff(4), Duration::from_secs(16));
    /// assert_eq!(strategy.backoff(5), Duration::from_secs(30));
    /// ```
    pub const fn exponential(base: Duration) -> Self {
        Self::new(Growth::Exponential, base)
    }

    pub const fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }

    pub const fn with_min(mut self, min: Duration) -> Self {
        self.min = min;
        self
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn backoff(&self, retry_count: u32) -> Duration {
        let delay = match self.growth {
            Growth::Constant => self.base,
            Growth::Linear => self.base.saturating_mul(retry_count),
            Growth::Exponential => {
                let factor = 2u32.checked_pow(retry_count.saturating_sub(1));
                factor.map_or(Duration::MAX, |factor| self.base.saturating_mul(factor))
            }
        };
        let delay = match self.max {
            Some(max) => delay.min(max),
            None => delay,
        };
        let delay = delay.max(self.min);
        match self.jitter {
            Some(jitter) => jitter.apply(delay),
            None => delay,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn linear_is_zero_before_the_first_retry() {
        let strategy = BackoffStrategy::linear(Duration::from_secs(5));
        assert_eq!(strategy.backoff(0), Duration::ZERO);
        assert_eq!(strategy.backoff(3), Duration::from_secs(15));
    }

    #[test]
    fn exponential_saturates_instead_of_overflowing() {
        let strategy = BackoffStrategy::exponential(Duration::from_secs(1));
        assert_eq!(strategy.backoff(200), Duration::MAX);
    }

    #[test]
    fn min_floors_the_delay() {
        let strategy =
            BackoffStrategy::linear(Duration::from_millis(10)).with_min(Duration::from_secs(1));
        assert_eq!(strategy.backoff(2), Duration::from_secs(1));
    }

    #[test]
    fn relative_jitter_stays_in_bounds() {
        let strategy =
            BackoffStrategy::constant(Duration::from_secs(10)).with_jitter(Jitter::Relative(0.1));
        for _ in 0..100 {
            let delay = strategy.backoff(1);
            assert!(delay >= Duration::from_secs(9), "{delay:?}");
            assert!(delay <= Duration::from_secs(11), "{delay:?}");
        }
    }

    #[test]
    fn absolute_jitter_never_goes_negative() {
        let strategy = BackoffStrategy::constant(Duration::from_millis(10))
            .with_jitter(Jitter::Absolute(Duration::from_secs(1)));
        for _ in 0..100 {
            assert!(strategy.backoff(1) <= Duration::from_millis(1010));
        }
    }
}
