//! Event system module
//!
//! Provides a pub/sub event bus that broadcasts per-run lifecycle events
//! (start, stdout/stderr chunks, completion, failure) to observers.

mod bus;

pub use bus::{EventBus, RunEvent};
