//! # Error types used by the fuelvisor runtime.
//!
//! One enum per failure domain:
//!
//! - [`PortError`] failures on the nozzle serial link.
//! - [`StoreError`] failures of the local transaction store.
//! - [`DirectoryError`] failures talking to the remote fleet directory.
//! - [`RuntimeError`] failures of the bootstrap/wiring layer itself.
//!
//! All types provide `as_label()` returning a short stable string for logs.
//! The refill supervisor never propagates these out of event handling; it
//! converts them into state transitions (deadline errors retry, transport
//! errors fault, store errors terminate the refill via operator ack).

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the nozzle port.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PortError {
    /// No reply of the expected verb family arrived within the deadline.
    #[error("no reply within {deadline:?} for {family}")]
    Timeout {
        /// Verb family the request was waiting on.
        family: &'static str,
        /// The configured response deadline.
        deadline: Duration,
    },

    /// The serial transport is gone (port closed, write failed).
    #[error("transport closed: {reason}")]
    TransportClosed { reason: String },

    /// A second request of the same verb family was issued while one was
    /// still outstanding. The supervisor is the single writer per family.
    #[error("request already outstanding for {family}")]
    Busy { family: &'static str },
}

impl PortError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            PortError::Timeout { .. } => "port_timeout",
            PortError::TransportClosed { .. } => "port_transport_closed",
            PortError::Busy { .. } => "port_busy",
        }
    }

    /// Deadline expiries are consumed locally and retried; everything else
    /// escalates to Faulted.
    pub fn is_deadline(&self) -> bool {
        matches!(self, PortError::Timeout { .. })
    }
}

/// Errors produced by the transaction store.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StoreError {
    /// No transaction with the given id.
    #[error("transaction {id} not found")]
    NotFound { id: u64 },

    /// Persisting the store file failed.
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding the store file failed.
    #[error("store codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "store_not_found",
            StoreError::Io(_) => "store_io",
            StoreError::Codec(_) => "store_codec",
        }
    }
}

/// Errors produced by the fleet directory client.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// Login was rejected (bad credentials or directory refused the tank).
    #[error("directory authentication failed: {reason}")]
    Auth { reason: String },

    /// The HTTP exchange failed after retries.
    #[error("directory request failed: {reason}")]
    Fetch { reason: String },

    /// The directory answered with a body we could not decode.
    #[error("directory response malformed: {reason}")]
    Decode { reason: String },
}

impl DirectoryError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            DirectoryError::Auth { .. } => "directory_auth",
            DirectoryError::Fetch { .. } => "directory_fetch",
            DirectoryError::Decode { .. } => "directory_decode",
        }
    }
}

/// Errors raised by the bootstrap/wiring layer (not by the supervisor).
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration file was present but unreadable or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The serial port could not be opened after bounded retries.
    #[error("serial open failed on {path}: {reason}")]
    SerialOpen { path: String, reason: String },

    /// Directory login or tag fetch failed during initialization.
    /// Fatal to bootstrap only; a running supervisor treats directory
    /// failures as events.
    #[error("directory init failed: {0}")]
    DirectoryInit(#[from] DirectoryError),

    /// The transaction store could not be opened.
    #[error("store init failed: {0}")]
    StoreInit(#[from] StoreError),

    /// The operator HTTP listener could not be bound.
    #[error("listen failed on {addr}: {reason}")]
    Listen { addr: String, reason: String },
}

impl RuntimeError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::Config(_) => "runtime_config",
            RuntimeError::SerialOpen { .. } => "runtime_serial_open",
            RuntimeError::DirectoryInit(_) => "runtime_directory_init",
            RuntimeError::StoreInit(_) => "runtime_store_init",
            RuntimeError::Listen { .. } => "runtime_listen",
        }
    }
}
