//! Nozzle transport: wire grammar, the link seam, and the serial port.

mod frame;
mod link;
mod serial;

pub use frame::{is_valid_tag, Command, Family, Frame, FrameError, RfidReading, NO_TAG};
pub use link::NozzleLink;
pub use serial::{open_serial, NozzlePort};
