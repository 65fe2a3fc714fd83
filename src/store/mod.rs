//! # Local transaction persistence.
//!
//! A dispensing transaction is created the moment the nozzle first confirms
//! tag contact, is updated as liters accumulate, and ends in exactly one
//! terminal status. Zero-liter refills delete the row instead of leaving a
//! zero behind.
//!
//! [`TransactionStore`] is the seam; [`FileStore`] is the shipped
//! implementation (a JSON file, writes serialized behind one lock). The
//! supervisor issues at most one write at a time.

mod file;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use file::FileStore;

/// Lifecycle of a dispensing transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    /// Row created on the first confirmed RFID match.
    Initiated,
    /// At least one progress write has landed.
    InProgress,
    /// Finalized with a positive dispensed amount.
    Completed,
    /// Removed (zero-liter dispense).
    Deleted,
    /// Left over from an interrupted run; flagged for review.
    NeedsReview,
}

/// A persisted dispensing transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: u64,
    pub tag: String,
    pub fleet_number: String,
    pub start_meter: Decimal,
    pub dispensed_liters: Decimal,
    pub machine_hours: u32,
    pub created_at: DateTime<Utc>,
    pub status: TxStatus,
}

/// Fields known at creation time.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub tag: String,
    pub fleet_number: String,
    pub start_meter: Decimal,
    pub machine_hours: u32,
}

/// Durable storage for dispensing transactions and the cumulative tank
/// total.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Creates a transaction in status `initiated` and returns it.
    async fn create(&self, new: NewTransaction) -> Result<Transaction, StoreError>;

    /// Persists the liters dispensed so far; moves the row to
    /// `in_progress` on the first write.
    async fn update_liters(&self, id: u64, liters: Decimal) -> Result<(), StoreError>;

    /// Finalizes the row with its final liters and status `completed`.
    async fn complete(&self, id: u64, final_liters: Decimal) -> Result<(), StoreError>;

    /// Removes the row. Zero-liter dispenses leave no transaction behind.
    async fn delete(&self, id: u64) -> Result<(), StoreError>;

    /// Adds to the cumulative liters dispensed from this tank.
    async fn add_dispensed(&self, liters: Decimal) -> Result<(), StoreError>;

    /// Flags any lingering non-terminal rows as `needs_review`; returns how
    /// many were flagged.
    async fn clear_incomplete(&self) -> Result<u32, StoreError>;
}
