//! OtaGuard - rollback-safe over-the-air firmware updates
//!
//! Device-side engine: persistent update state machine, authenticated
//! update commands, and self-test driven commit/rollback.

pub mod engine;

pub use engine::runtime::{Device, DeviceSettings};
pub use engine::updater::{Directive, UpdateStateMachine};
