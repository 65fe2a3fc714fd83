//! # Runtime events emitted by the supervisor and its collaborators.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Supervisor events**: state transitions and the refill outcome
//! - **Hardware events**: frame traffic and solenoid commands
//! - **Persistence events**: transaction lifecycle in the local store
//! - **Health events**: watch expiries and critical failures
//!
//! The [`Event`] struct carries metadata: the transition reason, the frame
//! text, a liter amount, the expired watch name.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases
//! monotonically, and both a wall-clock and a monotonic timestamp. Consumers
//! order by `seq`; interval math uses `monotonic`.
//!
//! ## Event flow example
//!
//! A happy-path refill emits, in order:
//! ```text
//! StateChanged (Idle → Starting → AwaitingFirstRfid → … → Dispensing)
//! TransactionOpened
//! SolenoidCommanded("open")
//! TransactionProgress (every persist step)
//! SolenoidCommanded("closed")
//! TransactionFinalized
//! StateChanged (… → AwaitingOperatorAck → Idle)
//! ```

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

use rust_decimal::Decimal;
use tokio::time::Instant;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Supervisor events ===
    /// The state machine moved; `state` holds `from -> to`, `reason` is
    /// always present.
    StateChanged,
    /// A refill finished with a positive dispensed amount.
    RefillCompleted,
    /// A refill ended with nothing dispensed; the transaction was deleted.
    ZeroDispense,

    // === Hardware events ===
    /// An inbound frame arrived (emitted before correlation).
    FrameReceived,
    /// An outbound command was written to the wire.
    FrameSent,
    /// The solenoid was commanded; `reason` is `"open"` or `"closed"`.
    SolenoidCommanded,

    // === Persistence events ===
    /// A transaction row was created for the current refill.
    TransactionOpened,
    /// Dispensed liters were persisted mid-refill.
    TransactionProgress,
    /// The transaction was completed with its final liters.
    TransactionFinalized,
    /// The transaction was deleted (0-liter dispense).
    TransactionDeleted,

    // === Health events ===
    /// A health watch expired; `reason` names the watch.
    WatchExpired,
    /// The supervisor entered Faulted or a recovery failed.
    CriticalError,
    /// Shutdown requested (OS signal received).
    ShutdownRequested,

    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    SubscriberPanicked,
    /// Subscriber dropped an event (queue full or worker closed).
    SubscriberOverflow,
}

/// Runtime event with optional metadata.
#[derive(Debug, Clone)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp (may go backwards, use for logging only).
    pub at: SystemTime,
    /// Monotonic timestamp (never goes backwards, use for intervals).
    pub monotonic: Instant,
    /// The kind of event.
    pub kind: EventKind,
    /// State annotation (`from -> to` for transitions).
    pub state: Option<String>,
    /// Human-readable reason or detail.
    pub reason: Option<String>,
    /// Raw frame text, for wire traffic events.
    pub frame: Option<String>,
    /// Liter amount, where relevant.
    pub liters: Option<Decimal>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamps and the
    /// next sequence number.
    pub fn now(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            monotonic: Instant::now(),
            kind,
            state: None,
            reason: None,
            frame: None,
            liters: None,
        }
    }

    /// Attaches a state annotation.
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Attaches a reason string.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches raw frame text.
    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.frame = Some(frame.into());
        self
    }

    /// Attaches a liter amount.
    pub fn with_liters(mut self, liters: Decimal) -> Self {
        self.liters = Some(liters);
        self
    }

    /// Creates a subscriber overflow event.
    pub fn subscriber_overflow(subscriber: &'static str, why: &'static str) -> Self {
        Event::now(EventKind::SubscriberOverflow)
            .with_reason(format!("subscriber={subscriber} reason={why}"))
    }

    /// Creates a subscriber panic event.
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::now(EventKind::SubscriberPanicked)
            .with_state(subscriber)
            .with_reason(info)
    }

    pub(crate) fn is_subscriber_overflow(&self) -> bool {
        self.kind == EventKind::SubscriberOverflow
    }

    pub(crate) fn is_subscriber_panic(&self) -> bool {
        self.kind == EventKind::SubscriberPanicked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_increase() {
        let a = Event::now(EventKind::StateChanged);
        let b = Event::now(EventKind::StateChanged);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn builders_attach_metadata() {
        let ev = Event::now(EventKind::TransactionFinalized)
            .with_reason("refill finished")
            .with_liters(Decimal::new(123, 1));
        assert_eq!(ev.reason.as_deref(), Some("refill finished"));
        assert_eq!(ev.liters, Some(Decimal::new(123, 1)));
    }
}
