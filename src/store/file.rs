//! JSON-file store. The whole state serializes on every mutation; volumes
//! here are a handful of rows per day, not a database workload.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::StoreError;

use super::{NewTransaction, Transaction, TransactionStore, TxStatus};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    next_id: u64,
    /// Cumulative liters dispensed from this tank.
    total_dispensed: Decimal,
    transactions: Vec<Transaction>,
}

/// File-backed [`TransactionStore`].
pub struct FileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileStore {
    /// Opens (or initializes) the store file.
    pub async fn open(path: PathBuf) -> Result<Self, StoreError> {
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState {
                next_id: 1,
                ..StoreState::default()
            },
            Err(e) => return Err(StoreError::Io(e)),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Cumulative liters dispensed from this tank.
    pub async fn total_dispensed(&self) -> Decimal {
        self.state.lock().await.total_dispensed
    }

    /// Snapshot of all persisted rows, newest last.
    pub async fn transactions(&self) -> Vec<Transaction> {
        self.state.lock().await.transactions.clone()
    }

    async fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let body = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&self.path, body).await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for FileStore {
    async fn create(&self, new: NewTransaction) -> Result<Transaction, StoreError> {
        let mut state = self.state.lock().await;
        let tx = Transaction {
            id: state.next_id,
            tag: new.tag,
            fleet_number: new.fleet_number,
            start_meter: new.start_meter,
            dispensed_liters: Decimal::ZERO,
            machine_hours: new.machine_hours,
            created_at: Utc::now(),
            status: TxStatus::Initiated,
        };
        state.next_id += 1;
        state.transactions.push(tx.clone());
        self.persist(&state).await?;
        Ok(tx)
    }

    async fn update_liters(&self, id: u64, liters: Decimal) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let tx = state
            .transactions
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(StoreError::NotFound { id })?;
        tx.dispensed_liters = liters;
        if tx.status == TxStatus::Initiated {
            tx.status = TxStatus::InProgress;
        }
        self.persist(&state).await
    }

    async fn complete(&self, id: u64, final_liters: Decimal) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let tx = state
            .transactions
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(StoreError::NotFound { id })?;
        tx.dispensed_liters = final_liters;
        tx.status = TxStatus::Completed;
        self.persist(&state).await
    }

    async fn delete(&self, id: u64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let before = state.transactions.len();
        state.transactions.retain(|t| t.id != id);
        if state.transactions.len() == before {
            return Err(StoreError::NotFound { id });
        }
        self.persist(&state).await
    }

    async fn add_dispensed(&self, liters: Decimal) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.total_dispensed += liters;
        self.persist(&state).await
    }

    async fn clear_incomplete(&self) -> Result<u32, StoreError> {
        let mut state = self.state.lock().await;
        let mut flagged = 0;
        for tx in &mut state.transactions {
            if matches!(tx.status, TxStatus::Initiated | TxStatus::InProgress) {
                tx.status = TxStatus::NeedsReview;
                flagged += 1;
            }
        }
        if flagged > 0 {
            self.persist(&state).await?;
        }
        Ok(flagged)
    }
}
