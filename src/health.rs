//! # Health monitor.
//!
//! Tracks three independent last-seen timestamps and their budgets:
//!
//! | Watch    | Refreshed by                                        | Budget |
//! |----------|-----------------------------------------------------|--------|
//! | Board    | `heartbeat(0)` replies                              | 40 s   |
//! | Nozzle   | any frame originating from the configured nozzle    | 40 s   |
//! | Operator | every successful operator HTTP interaction          | 10 min while a refill is active, unbounded in Idle |
//!
//! The supervisor reads expirations on tick and consumes them as events,
//! never as exceptions. The monitor is shared: the port reader and the
//! operator handlers refresh it, only the supervisor evaluates it.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// One of the three supervised liveness channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watch {
    /// Nozzle control board heartbeat replies.
    Board,
    /// Frames originating from the nozzle itself.
    Nozzle,
    /// Operator application contact.
    Operator,
}

impl Watch {
    /// Stable name for reasons and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Watch::Board => "board heartbeat",
            Watch::Nozzle => "nozzle heartbeat",
            Watch::Operator => "operator contact",
        }
    }
}

struct Seen {
    board: Instant,
    nozzle: Instant,
    operator: Instant,
    refill_active: bool,
}

/// Shared last-seen tracker with per-watch budgets.
pub struct HealthMonitor {
    board_budget: Duration,
    nozzle_budget: Duration,
    operator_budget: Duration,
    seen: Mutex<Seen>,
}

impl HealthMonitor {
    /// Creates a monitor with all watches freshly touched.
    pub fn new(board: Duration, nozzle: Duration, operator: Duration) -> Self {
        let now = Instant::now();
        Self {
            board_budget: board,
            nozzle_budget: nozzle,
            operator_budget: operator,
            seen: Mutex::new(Seen {
                board: now,
                nozzle: now,
                operator: now,
                refill_active: false,
            }),
        }
    }

    /// Refreshes one watch to "now".
    pub fn touch(&self, watch: Watch) {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap();
        match watch {
            Watch::Board => seen.board = now,
            Watch::Nozzle => seen.nozzle = now,
            Watch::Operator => seen.operator = now,
        }
    }

    /// Toggles the operator budget. Activation also refreshes the operator
    /// watch so a refill never starts pre-expired.
    pub fn set_refill_active(&self, active: bool) {
        let mut seen = self.seen.lock().unwrap();
        seen.refill_active = active;
        if active {
            seen.operator = Instant::now();
        }
    }

    /// Refreshes the nozzle and operator watches; part of the supervisor's
    /// refill-scope reset.
    pub fn reset_refill_watches(&self) {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap();
        seen.nozzle = now;
        seen.operator = now;
    }

    /// True if the given watch has outlived its budget at `now`.
    pub fn is_expired(&self, watch: Watch, now: Instant) -> bool {
        let seen = self.seen.lock().unwrap();
        match watch {
            Watch::Board => now.duration_since(seen.board) > self.board_budget,
            Watch::Nozzle => now.duration_since(seen.nozzle) > self.nozzle_budget,
            Watch::Operator => {
                seen.refill_active && now.duration_since(seen.operator) > self.operator_budget
            }
        }
    }

    /// The set of expired watches at `now`, evaluated each tick.
    pub fn expired(&self, now: Instant) -> Vec<Watch> {
        [Watch::Board, Watch::Nozzle, Watch::Operator]
            .into_iter()
            .filter(|w| self.is_expired(*w, now))
            .collect()
    }

    /// How long the board has been silent at `now`.
    pub fn board_silence(&self, now: Instant) -> Duration {
        now.duration_since(self.seen.lock().unwrap().board)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(
            Duration::from_secs(40),
            Duration::from_secs(40),
            Duration::from_secs(600),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn watches_expire_on_their_own_budgets() {
        let m = monitor();
        m.set_refill_active(true);
        tokio::time::advance(Duration::from_secs(41)).await;
        let expired = m.expired(Instant::now());
        assert!(expired.contains(&Watch::Board));
        assert!(expired.contains(&Watch::Nozzle));
        assert!(!expired.contains(&Watch::Operator));
    }

    #[tokio::test(start_paused = true)]
    async fn touch_refreshes_a_single_watch() {
        let m = monitor();
        tokio::time::advance(Duration::from_secs(39)).await;
        m.touch(Watch::Nozzle);
        tokio::time::advance(Duration::from_secs(2)).await;
        let now = Instant::now();
        assert!(m.is_expired(Watch::Board, now));
        assert!(!m.is_expired(Watch::Nozzle, now));
    }

    #[tokio::test(start_paused = true)]
    async fn operator_watch_is_unbounded_outside_a_refill() {
        let m = monitor();
        tokio::time::advance(Duration::from_secs(100_000)).await;
        assert!(!m.is_expired(Watch::Operator, Instant::now()));

        m.set_refill_active(true);
        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(m.is_expired(Watch::Operator, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn activating_a_refill_starts_the_operator_clock_fresh() {
        let m = monitor();
        tokio::time::advance(Duration::from_secs(10_000)).await;
        m.set_refill_active(true);
        assert!(!m.is_expired(Watch::Operator, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn board_silence_is_measured() {
        let m = monitor();
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(m.board_silence(Instant::now()), Duration::from_secs(90));
    }
}
