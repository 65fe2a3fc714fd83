//! Observability: the subscriber trait, the fan-out set, and the built-in
//! log writer.

mod log;
mod set;
mod subscriber;

pub use self::log::LogWriter;
pub use set::SubscriberSet;
pub use subscriber::Subscribe;
