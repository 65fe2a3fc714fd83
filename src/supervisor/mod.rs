//! # Supervisor core: the deterministic refill state machine.
//!
//! This module contains the embedded implementation of the dispensing
//! cycle. The public surface is [`Supervisor`] plus the input/output
//! vocabulary the wiring layer speaks; everything else is an internal
//! building block.
//!
//! ## Files & responsibilities
//! - **machine.rs**: the reactor; owns every piece of refill state, handles
//!   one input at a time, issues outbound nozzle/store/directory calls,
//!   records transitions, publishes snapshots.
//! - **state.rs**: the thirteen states, their predecessor sets, and the
//!   transition record.
//! - **context.rs**: refill-scoped working state (vehicle, transaction,
//!   meter filter, retry budgets, latched frames), zeroed on Idle entry.
//! - **inputs.rs**: operator commands and their outcomes.
//! - **status.rs**: the serializable snapshot published after every input.
//!
//! ## Event data-plane
//!
//! Producers (publish to Bus):
//! - **Supervisor** → `StateChanged`, `SolenoidCommanded`, transaction
//!   lifecycle events, `WatchExpired`, `CriticalError`, `ZeroDispense`
//! - **NozzlePort** → `FrameReceived` (before correlation), `FrameSent`
//!
//! Consumers (subscribe to Bus):
//! - the wiring layer's event pump, which fans out to the subscriber set
//!   (logging and any custom observers). Nothing on the bus calls back
//!   into the supervisor.
//!
//! ## Ordering guarantee
//! Within one refill the outbound sequence is fixed end-to-end:
//! ```text
//! pair_nozzle → rfid_get → meter_reset → first meter_read → rfid_get_cont
//!   → set_solenoid(1) → meter_read* → set_solenoid(0) → rfid_stop
//!   → final meter_read(s) → finalization → operator notification
//! ```

mod context;
mod inputs;
mod machine;
mod state;
mod status;

pub use inputs::{CommandKind, CommandOutcome, OperatorCommand};
pub use machine::Supervisor;
pub use state::RefillState;
pub use status::{MeterSnapshot, StatusSnapshot};
