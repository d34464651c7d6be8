//! Shared service helpers: telemetry wiring, user notifications and
//! per-user conversation state.

pub mod conversation;
pub mod notify;
pub mod telemetry;

pub use conversation::*;
pub use notify::*;
pub use telemetry::*;
