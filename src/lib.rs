//! # fuelvisor
//!
//! **Fuelvisor** supervises an automated vehicle fuel-dispensing cycle: a
//! physical nozzle identifies the vehicle via an RFID tag, a flow meter
//! measures dispensed liters, and a solenoid valve gates fuel flow.
//! Authorization happens against a remote fleet directory; the operator
//! application drives the cycle over HTTP and polls for progress.
//!
//! ## Components
//!
//! | Area              | Description                                                    | Key types                                  |
//! |-------------------|----------------------------------------------------------------|--------------------------------------------|
//! | **Supervisor**    | Deterministic state machine over one input queue.              | [`Supervisor`], [`RefillState`]            |
//! | **Nozzle port**   | Line-framed serial transport, correlation by verb family.      | [`port::NozzlePort`], [`port::Command`]    |
//! | **Meter filter**  | N-identical-readings-over-T stability detection.               | [`StabilityFilter`]                        |
//! | **Health**        | Board / nozzle / operator last-seen watches.                   | [`HealthMonitor`], [`Watch`]               |
//! | **Directory**     | Permitted-vehicle set from the fleet API, cached tag lookup.   | [`directory::FleetDirectory`]              |
//! | **Store**         | Transaction rows and the cumulative tank total, JSON-backed.   | [`store::TransactionStore`]                |
//! | **Operator API**  | axum surface: start, odometer, status, operation façade.       | [`api::router`], [`api::AppState`]         |
//! | **Events**        | Broadcast bus plus subscriber fan-out for observability.       | [`Bus`], [`Event`], [`subscribers::Subscribe`] |
//! | **Errors**        | Typed errors per failure domain.                               | [`PortError`], [`StoreError`], [`DirectoryError`] |
//!
//! ## Shape
//!
//! One reactor task owns the machine; three sources feed it (serial
//! frames, operator commands, a ~1 s tick). Collaborators sit behind
//! narrow traits so the machine is driven in tests by scripted fakes.
//! Nothing observes the supervisor through back-references: it publishes
//! events on the bus and snapshots on a watch channel.

pub mod api;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod health;
pub mod meter;
pub mod policies;
pub mod port;
pub mod shutdown;
pub mod store;
pub mod subscribers;
pub mod supervisor;

// ---- Public re-exports ----

pub use config::Config;
pub use error::{DirectoryError, PortError, RuntimeError, StoreError};
pub use events::{Bus, Event, EventKind};
pub use health::{HealthMonitor, Watch};
pub use meter::{Observation, StabilityFilter};
pub use supervisor::{
    CommandKind, CommandOutcome, OperatorCommand, RefillState, StatusSnapshot, Supervisor,
};
