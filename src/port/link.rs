//! # The narrow interface the supervisor holds on the nozzle.
//!
//! [`NozzleLink`] is the seam between the state machine and the transport.
//! The production implementation is [`NozzlePort`](super::NozzlePort) over a
//! serial line; tests substitute a scripted fake.
//!
//! Inbound frames do not flow through this trait: the port forwards every
//! frame into the supervisor's input queue, so the machine observes
//! unsolicited traffic and timer-driven replies uniformly.

use async_trait::async_trait;

use crate::error::PortError;

use super::frame::{Command, Frame};

/// Write access to the nozzle controller.
#[async_trait]
pub trait NozzleLink: Send + Sync {
    /// Writes an expect-response command and waits for the next inbound
    /// frame of the same verb family, up to the port's response deadline.
    ///
    /// Fails with [`PortError::Timeout`] on deadline expiry (the transport
    /// is not cancelled), [`PortError::Busy`] if a request of this family is
    /// already outstanding, and [`PortError::TransportClosed`] when the
    /// line is gone.
    async fn request(&self, cmd: Command) -> Result<Frame, PortError>;

    /// Writes a command without expecting a reply.
    async fn send(&self, cmd: Command) -> Result<(), PortError>;
}
