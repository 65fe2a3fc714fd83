//! # Status snapshot.
//!
//! After every handled input the supervisor publishes a serializable
//! snapshot on a `watch` channel. The operator surface answers polls from
//! the latest snapshot without entering the machine's queue; the typed
//! extras (skipped during serialization) drive the operation façade's
//! response mapping.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::directory::Vehicle;
use crate::store::Transaction;

use super::state::RefillState;

/// The filter's three tracked values.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterSnapshot {
    pub current: Decimal,
    pub last_stable: Decimal,
    pub last_saved: Decimal,
}

/// Everything the operator application sees in one poll.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: String,
    pub previous_state: String,
    /// Wall-clock instant of the last transition.
    pub timestamp: DateTime<Utc>,
    pub transaction: Option<Transaction>,
    pub vehicle: Option<Vehicle>,
    pub meter: MeterSnapshot,
    pub message: String,

    /// Typed state for the operation façade.
    #[serde(skip)]
    pub current: RefillState,
    /// Whether the last refill ended by operator request.
    #[serde(skip)]
    pub finished_by_user: bool,
    /// Final liters of the last finalized refill.
    #[serde(skip)]
    pub final_liters: Option<Decimal>,
}
