//! # Fleet directory: which vehicles may fuel from this tank.
//!
//! The directory is a remote HTTP service. At initialization the client
//! logs in and pulls the permitted vehicle set for the configured tank;
//! tag validation afterwards is a client-side lookup over that set, so the
//! supervisor never blocks a refill on the network.
//!
//! [`FleetDirectory`] is the seam; [`HttpDirectory`] is the shipped
//! implementation.

mod http;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::DirectoryError;

pub use http::HttpDirectory;

/// A vehicle record as the directory returns it. Retained by the
/// supervisor for the duration of one refill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    /// 24-hex-character RFID tag, casing preserved as received.
    pub tag: String,
    pub fleet_number: String,
    pub tank_capacity_liters: Decimal,
    pub current_machine_hours: u32,
}

/// Client view of the fleet directory.
#[async_trait]
pub trait FleetDirectory: Send + Sync {
    /// Logs in if needed and replaces the cached permitted-vehicle set.
    /// Returns how many vehicles the directory listed.
    async fn refresh_tags(&self) -> Result<usize, DirectoryError>;

    /// Looks a tag up in the cached set. Exact, case-sensitive equality.
    async fn validate_tag(&self, tag: &str) -> Option<Vehicle>;

    /// Reports the vehicle's updated working hours after a refill.
    /// Best-effort: callers log a warning on failure and proceed.
    async fn update_vehicle_hours(&self, tag: &str, hours: u32) -> Result<(), DirectoryError>;
}
