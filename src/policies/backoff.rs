//! # Backoff policy for retrying remote calls.
//!
//! [`BackoffPolicy`] controls how retry delays grow after repeated failures
//! of the fleet directory. It is parameterized by:
//! - [`BackoffPolicy::factor`] the multiplicative growth factor;
//! - [`BackoffPolicy::first`] the initial delay;
//! - [`BackoffPolicy::max`] the maximum delay cap;
//! - [`BackoffPolicy::jitter`] optional randomization.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use fuelvisor::policies::{BackoffPolicy, JitterPolicy};
//!
//! let backoff = BackoffPolicy {
//!     first: Duration::from_millis(500),
//!     max: Duration::from_secs(10),
//!     factor: 2.0,
//!     jitter: JitterPolicy::None,
//! };
//!
//! assert_eq!(backoff.next(None), Duration::from_millis(500));
//! assert_eq!(backoff.next(Some(Duration::from_millis(500))), Duration::from_secs(1));
//! // Capped at max.
//! assert_eq!(backoff.next(Some(Duration::from_secs(20))), Duration::from_secs(10));
//! ```

use std::time::Duration;

use rand::Rng;

/// Policy controlling randomization of retry delays.
///
/// Prevents synchronized retries when several boards share one directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum JitterPolicy {
    /// No jitter: use exact backoff delay.
    #[default]
    None,
    /// Full jitter: random delay in `[0, backoff_delay]`.
    Full,
    /// Equal jitter: `delay/2 + random[0, delay/2]`.
    Equal,
}

impl JitterPolicy {
    /// Applies jitter to the given delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            JitterPolicy::None => delay,
            JitterPolicy::Full => {
                let ms = delay.as_millis() as u64;
                Duration::from_millis(rand::thread_rng().gen_range(0..=ms.max(1)))
            }
            JitterPolicy::Equal => {
                let half = delay / 2;
                let ms = half.as_millis() as u64;
                half + Duration::from_millis(rand::thread_rng().gen_range(0..=ms.max(1)))
            }
        }
    }
}

/// Retry backoff policy.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Initial delay before the first retry.
    pub first: Duration,
    /// Maximum delay cap for retries.
    pub max: Duration,
    /// Multiplicative growth factor (`>= 1.0` recommended).
    pub factor: f64,
    /// Jitter policy.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// Returns a strategy suited to the directory client:
    /// `first = 500ms`, `factor = 2.0`, `max = 10s`, no jitter.
    fn default() -> Self {
        Self {
            first: Duration::from_millis(500),
            max: Duration::from_secs(10),
            factor: 2.0,
            jitter: JitterPolicy::None,
        }
    }
}

impl BackoffPolicy {
    /// Computes the next delay based on the previous one.
    ///
    /// - If `prev` is `None`, returns `first` clamped to `max`.
    /// - Otherwise multiplies the previous delay by `factor`, capped at `max`.
    pub fn next(&self, prev: Option<Duration>) -> Duration {
        let unclamped = match prev {
            None => self.first,
            Some(d) => {
                let mul = d.as_secs_f64() * self.factor;
                if !mul.is_finite() {
                    self.max
                } else {
                    d.mul_f64(self.factor)
                }
            }
        };
        self.jitter.apply(unclamped.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_caps() {
        let b = BackoffPolicy::default();
        let d1 = b.next(None);
        assert_eq!(d1, Duration::from_millis(500));
        let d2 = b.next(Some(d1));
        assert_eq!(d2, Duration::from_secs(1));
        assert_eq!(b.next(Some(Duration::from_secs(60))), Duration::from_secs(10));
    }

    #[test]
    fn full_jitter_stays_bounded() {
        let b = BackoffPolicy {
            jitter: JitterPolicy::Full,
            ..BackoffPolicy::default()
        };
        for _ in 0..50 {
            assert!(b.next(Some(Duration::from_secs(4))) <= Duration::from_secs(8));
        }
    }
}
