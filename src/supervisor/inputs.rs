//! # Operator commands.
//!
//! The operator HTTP handlers drive the machine through these. Frames
//! arrive on their own queue and the tick is armed inside the reactor;
//! commands are the third input source, each carrying an optional reply
//! channel for the guard verdict.

use tokio::sync::oneshot;

use super::state::RefillState;

/// Operator request with an optional reply channel.
///
/// Status polls are fire-and-forget (the snapshot channel answers them);
/// state-changing commands wait for the outcome.
pub struct OperatorCommand {
    pub kind: CommandKind,
    pub reply: Option<oneshot::Sender<CommandOutcome>>,
}

/// The operator verbs the supervisor accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Begin a refill. Only Idle accepts this.
    StartRefill,
    /// Submit the vehicle's working hours. Only AwaitingOdometer accepts
    /// this; the range gate is `0..=1000`.
    SubmitOdometer { hours: i64 },
    /// Stop dispensing now. Only Dispensing and Interrupted accept this.
    ForceFinish,
    /// The operator looked at the status; acknowledges a finished refill.
    StatusPolled,
}

/// Reply to a state-changing operator command.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    /// The command was applied; `state` is the state after handling.
    Accepted { state: RefillState },
    /// The guard rejected the command; the supervisor did not move.
    Rejected {
        error: String,
        current: RefillState,
        allowed: RefillState,
    },
}
