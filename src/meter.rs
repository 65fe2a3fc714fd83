//! # Meter stability filter.
//!
//! Consumes raw flow-meter readings one at a time and decides when the
//! meter has settled. A reading is *stable* when the most recent N readings
//! are numerically equal **and** at least `stability_duration` has elapsed
//! since the first reading of that run. Equality is exact decimal
//! comparison, free of float rounding, and scale-insensitive: `12.3` and
//! `12.30` are the same reading.
//!
//! ## Rules
//! - The window holds at most 2·N readings.
//! - `last_stable` advances on the unstable→stable edge and never
//!   decreases.
//! - A reading strictly below `last_stable` is reported as a regression
//!   (meters can wrap or glitch) and changes no state.
//! - `last_saved` is bookkeeping for the persistence step; the supervisor
//!   advances it after a successful store write.
//! - The filter never blocks and keeps no timers of its own; the caller
//!   supplies the observation instant.

use std::collections::VecDeque;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::Instant;

/// Outcome of feeding one reading into the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// The run is not (yet) stable.
    Pending,
    /// The unstable→stable edge: `last_stable` just advanced to this value.
    BecameStable(Decimal),
    /// The run was already stable and the value repeated.
    StillStable(Decimal),
    /// Reading below `last_stable`; reported, state untouched.
    Regressed(Decimal),
}

/// Sliding-window stability detector over meter readings.
#[derive(Debug, Clone)]
pub struct StabilityFilter {
    n: usize,
    duration: Duration,
    window: VecDeque<Decimal>,
    current: Decimal,
    last_stable: Decimal,
    last_saved: Decimal,
    /// First observation instant of the current equal-value run.
    run_started: Option<Instant>,
    run_value: Option<Decimal>,
    stable: bool,
}

impl StabilityFilter {
    /// Creates a filter requiring `n` identical readings spanning at least
    /// `duration`.
    pub fn new(n: usize, duration: Duration) -> Self {
        Self {
            n: n.max(1),
            duration,
            window: VecDeque::new(),
            current: Decimal::ZERO,
            last_stable: Decimal::ZERO,
            last_saved: Decimal::ZERO,
            run_started: None,
            run_value: None,
            stable: false,
        }
    }

    /// Feeds one reading observed at `now`.
    pub fn observe(&mut self, value: Decimal, now: Instant) -> Observation {
        if value < self.last_stable {
            return Observation::Regressed(value);
        }

        if self.run_value != Some(value) {
            self.run_value = Some(value);
            self.run_started = Some(now);
            self.stable = false;
        }

        self.window.push_back(value);
        while self.window.len() > 2 * self.n {
            self.window.pop_front();
        }
        self.current = value;

        let run_old_enough = self
            .run_started
            .map(|t| now.duration_since(t) >= self.duration)
            .unwrap_or(false);
        let tail_equal = self.window.len() >= self.n
            && self.window.iter().rev().take(self.n).all(|v| *v == value);

        if tail_equal && run_old_enough {
            if self.stable {
                Observation::StillStable(value)
            } else {
                self.stable = true;
                self.last_stable = value;
                Observation::BecameStable(value)
            }
        } else {
            Observation::Pending
        }
    }

    /// Latest accepted reading.
    pub fn current(&self) -> Decimal {
        self.current
    }

    /// Last value the filter marked stable.
    pub fn last_stable(&self) -> Decimal {
        self.last_stable
    }

    /// Last value persisted to the store.
    pub fn last_saved(&self) -> Decimal {
        self.last_saved
    }

    /// Records a successful store write of `value`.
    pub fn mark_saved(&mut self, value: Decimal) {
        self.last_saved = value;
    }

    /// Zeroes every tracked value; used when a refill scope resets.
    pub fn reset(&mut self) {
        self.window.clear();
        self.current = Decimal::ZERO;
        self.last_stable = Decimal::ZERO;
        self.last_saved = Decimal::ZERO;
        self.run_started = None;
        self.run_value = None;
        self.stable = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn filter() -> StabilityFilter {
        StabilityFilter::new(2, Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn two_equal_readings_five_seconds_apart_are_stable() {
        let mut f = filter();
        assert_eq!(f.observe(dec("12.3"), Instant::now()), Observation::Pending);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(
            f.observe(dec("12.3"), Instant::now()),
            Observation::BecameStable(dec("12.3"))
        );
        assert_eq!(f.last_stable(), dec("12.3"));
    }

    #[tokio::test(start_paused = true)]
    async fn equal_readings_too_close_stay_pending() {
        let mut f = filter();
        f.observe(dec("9.0"), Instant::now());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(f.observe(dec("9.0"), Instant::now()), Observation::Pending);
        assert_eq!(f.last_stable(), Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn a_changed_value_restarts_the_run() {
        let mut f = filter();
        f.observe(dec("4.1"), Instant::now());
        tokio::time::advance(Duration::from_secs(5)).await;
        // New value: the old run's age does not carry over.
        assert_eq!(f.observe(dec("9.0"), Instant::now()), Observation::Pending);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(
            f.observe(dec("9.0"), Instant::now()),
            Observation::BecameStable(dec("9.0"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stability_is_reported_once_then_sustained() {
        let mut f = filter();
        f.observe(dec("12.3"), Instant::now());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(
            f.observe(dec("12.3"), Instant::now()),
            Observation::BecameStable(dec("12.3"))
        );
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            f.observe(dec("12.3"), Instant::now()),
            Observation::StillStable(dec("12.3"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn readings_below_last_stable_do_not_decrease_it() {
        let mut f = filter();
        f.observe(dec("10.0"), Instant::now());
        tokio::time::advance(Duration::from_secs(5)).await;
        f.observe(dec("10.0"), Instant::now());
        assert_eq!(f.last_stable(), dec("10.0"));

        assert_eq!(
            f.observe(dec("3.5"), Instant::now()),
            Observation::Regressed(dec("3.5"))
        );
        assert_eq!(f.last_stable(), dec("10.0"));
        assert_eq!(f.current(), dec("10.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn ordering_invariants_hold_while_observing() {
        let mut f = filter();
        for (step, v) in ["0.0", "4.1", "9.0", "12.3", "12.3"].iter().enumerate() {
            f.observe(dec(v), Instant::now());
            assert!(f.last_stable() <= f.current(), "step {step}");
            assert!(f.last_saved() <= f.last_stable(), "step {step}");
            tokio::time::advance(Duration::from_secs(6)).await;
        }
        assert_eq!(f.last_stable(), dec("12.3"));
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_zeroes_compare_equal() {
        // Scale-insensitive decimal comparison: 12.30 continues a 12.3 run.
        let mut f = filter();
        f.observe(dec("12.3"), Instant::now());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(
            f.observe(dec("12.30"), Instant::now()),
            Observation::BecameStable(dec("12.30"))
        );
    }

    #[test]
    fn window_is_bounded_to_twice_n() {
        let mut f = StabilityFilter::new(2, Duration::ZERO);
        for i in 0..10 {
            f.observe(Decimal::from(i), Instant::now());
        }
        assert!(f.window.len() <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_zeroes_everything() {
        let mut f = filter();
        f.observe(dec("5.0"), Instant::now());
        tokio::time::advance(Duration::from_secs(5)).await;
        f.observe(dec("5.0"), Instant::now());
        f.mark_saved(dec("5.0"));
        f.reset();
        assert_eq!(f.current(), Decimal::ZERO);
        assert_eq!(f.last_stable(), Decimal::ZERO);
        assert_eq!(f.last_saved(), Decimal::ZERO);
    }
}
