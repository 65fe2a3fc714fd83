//! # Event subscriber trait.
//!
//! [`Subscribe`] is the extension point for plugging custom observers into
//! the runtime: dashboards, audit sinks, alerting.
//!
//! Each subscriber gets:
//! - **Dedicated worker task** (runs independently)
//! - **Bounded queue** (capacity via [`Subscribe::queue_capacity`])
//! - **Panic isolation** (panics caught, reported as `SubscriberPanicked`)
//!
//! ## Rules
//! - Slow subscribers only affect themselves (queue overflow → event drop)
//! - Panics do not crash the runtime or other subscribers
//! - Subscribers never block the supervisor

use async_trait::async_trait;

use crate::events::Event;

/// Event subscriber for runtime observability.
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Processes a single event.
    ///
    /// Called from a dedicated worker task, in FIFO order. Handle errors
    /// internally; a panic is caught and reported but the event is gone.
    async fn on_event(&self, event: &Event);

    /// Subscriber name for overflow/panic diagnostics.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Preferred queue capacity (default 1024, clamped to >= 1).
    fn queue_capacity(&self) -> usize {
        1024
    }
}
