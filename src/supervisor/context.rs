//! # Refill-scoped working state.
//!
//! Everything here lives for at most one refill and is zeroed on every
//! re-entry into Idle: the bound vehicle, the open transaction, the meter
//! filter, the retry budgets, the latched unsolicited frames, and the
//! operator-facing message. The supervisor owns this exclusively; nothing
//! else mutates it.

use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::Instant;

use crate::config::Config;
use crate::directory::Vehicle;
use crate::meter::StabilityFilter;
use crate::policies::RetryBudget;
use crate::port::{Family, Frame};
use crate::store::Transaction;

/// An issued expect-response command the machine is waiting on.
///
/// The machine sends fire-and-forget and consumes the reply as an inbound
/// frame; this records which family it is waiting for and until when.
#[derive(Debug, Clone, Copy)]
pub struct PendingRequest {
    pub family: Family,
    pub sent_at: Instant,
    pub deadline: Duration,
}

impl PendingRequest {
    pub fn new(family: Family, deadline: Duration) -> Self {
        Self {
            family,
            sent_at: Instant::now(),
            deadline,
        }
    }

    pub fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.sent_at) >= self.deadline
    }
}

/// Mutable state scoped to one refill.
pub struct RefillContext {
    /// Vehicle bound after a directory-confirmed RFID read.
    pub vehicle: Option<Vehicle>,
    /// Open transaction, present iff an RFID match has been confirmed.
    pub tx: Option<Transaction>,
    /// Meter stability tracking.
    pub filter: StabilityFilter,
    /// Operator-facing message ("Meter read error", ...).
    pub message: String,

    /// Set when the operator polls status in AwaitingOperatorAck.
    pub app_informed: bool,
    /// An `rfid_match` has been seen and no `rfid_alarm` since.
    pub rfid_in_contact: bool,
    /// The refill ended by operator request (`refill_finish`).
    pub finished_by_user: bool,
    /// Final liters of the last finalized refill.
    pub final_liters: Option<Decimal>,

    /// Odometer/working-hours value the operator submitted.
    pub drf_hours: Option<u32>,
    /// Meter value captured by the first read after `meter_reset`.
    pub start_meter: Decimal,
    /// At least one `rfid_get` reply arrived this refill.
    pub saw_rfid_reply: bool,

    /// The reply family the machine is currently waiting on.
    pub pending: Option<PendingRequest>,
    /// Last attempt instant for interval-paced loops (Interrupted).
    pub last_attempt: Option<Instant>,

    /// `rfid_get` attempts in AwaitingFirstRfid.
    pub rfid_budget: RetryBudget,
    /// Tag-match wait attempts in AwaitingTagMatch.
    pub match_budget: RetryBudget,
    /// Meter-read attempts (first read, then dispensing).
    pub meter_budget: RetryBudget,
    /// Final meter-read attempts.
    pub final_budget: RetryBudget,
    /// Recovery probes in Interrupted.
    pub interrupt_budget: RetryBudget,
    /// Recovery sequences in Faulted.
    pub fault_budget: RetryBudget,

    /// Latched unsolicited frames, most-recent-wins. Latched rather than
    /// queued because they are idempotent.
    pub latched_match: Option<Frame>,
    pub latched_alarm: Option<Frame>,
}

impl RefillContext {
    pub fn new(cfg: &Config) -> Self {
        Self {
            vehicle: None,
            tx: None,
            filter: StabilityFilter::new(
                cfg.meter_stability_window,
                cfg.meter_stability_duration(),
            ),
            message: String::new(),
            app_informed: false,
            rfid_in_contact: false,
            finished_by_user: false,
            final_liters: None,
            drf_hours: None,
            start_meter: Decimal::ZERO,
            saw_rfid_reply: false,
            pending: None,
            last_attempt: None,
            rfid_budget: RetryBudget::new(cfg.max_rfid_retries),
            match_budget: RetryBudget::new(cfg.tag_match_retries),
            meter_budget: RetryBudget::new(cfg.dispense_meter_retries),
            final_budget: RetryBudget::new(cfg.final_meter_retries),
            interrupt_budget: RetryBudget::new(cfg.interrupt_retries()),
            fault_budget: RetryBudget::new(3),
            latched_match: None,
            latched_alarm: None,
        }
    }

    /// Zeroes the refill scope: filter, vehicle, transaction, flags,
    /// budgets, latched frames.
    pub fn reset(&mut self, cfg: &Config) {
        *self = Self::new(cfg);
    }
}
