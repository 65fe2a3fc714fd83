//! # LogWriter - renders bus events through the `log` facade.
//!
//! ## Example output
//! ```text
//! [transition] Idle -> Starting [operator start]
//! [solenoid] open
//! [tx] progress 4.1 L
//! [refill] completed 12.3 L
//! [watch] expired: nozzle heartbeat
//! ```

use async_trait::async_trait;

use crate::events::{Event, EventKind};

use super::subscriber::Subscribe;

/// Built-in logging subscriber.
pub struct LogWriter;

impl LogWriter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for LogWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let reason = e.reason.as_deref().unwrap_or("");
        match e.kind {
            EventKind::StateChanged => {
                log::info!(
                    "[transition] {} [{reason}]",
                    e.state.as_deref().unwrap_or("?")
                );
            }
            EventKind::SolenoidCommanded => {
                log::info!("[solenoid] {reason}");
            }
            EventKind::TransactionOpened => {
                log::info!("[tx] opened: {reason}");
            }
            EventKind::TransactionProgress => {
                log::debug!("[tx] progress {} L", e.liters.unwrap_or_default());
            }
            EventKind::TransactionFinalized => {
                log::info!("[tx] finalized {} L", e.liters.unwrap_or_default());
            }
            EventKind::TransactionDeleted => {
                log::info!("[tx] deleted: {reason}");
            }
            EventKind::RefillCompleted => {
                log::info!("[refill] completed {} L", e.liters.unwrap_or_default());
            }
            EventKind::ZeroDispense => {
                log::info!("[refill] {reason}");
            }
            EventKind::WatchExpired => {
                log::warn!("[watch] expired: {reason}");
            }
            EventKind::CriticalError => {
                log::error!("[critical] {reason}");
            }
            EventKind::ShutdownRequested => {
                log::info!("[shutdown] requested");
            }
            EventKind::FrameReceived => {
                log::debug!("[rx] {}", e.frame.as_deref().unwrap_or(""));
            }
            EventKind::FrameSent => {
                log::debug!("[tx-wire] {}", e.frame.as_deref().unwrap_or(""));
            }
            EventKind::SubscriberPanicked => {
                log::error!(
                    "[subscriber] {} panicked: {reason}",
                    e.state.as_deref().unwrap_or("?")
                );
            }
            EventKind::SubscriberOverflow => {
                log::warn!("[subscriber] overflow: {reason}");
            }
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }
}
