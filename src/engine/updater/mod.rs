//! OtaGuard Update System
//!
//! A rollback-safe, authenticated firmware update system.
//!
//! Components:
//! - `store` - Fixed-layout durable record region
//! - `state` - Update state machine
//! - `command` - Update command model and topic addressing
//! - `auth` - HMAC command authentication
//! - `orchestrator` - Command handling and install outcome decisions
//! - `selftest` - Post-boot self-test supervisor
//! - `installer` - HTTP download, checksum verification, activation
//! - `slots` - Versioned firmware image layout
//! - `telemetry` - Status and heartbeat reporting
//! - `clock` - Monotonic clock for the runtime tick

pub mod auth;
pub mod clock;
pub mod command;
pub mod error;
pub mod installer;
pub mod orchestrator;
pub mod selftest;
pub mod slots;
pub mod state;
pub mod store;
pub mod telemetry;

pub use auth::{AuthOutcome, CommandAuthenticator};
pub use command::{CommandTarget, UpdateCommand};
pub use error::{Result, UpdateError, UpdateFault};
pub use installer::{InstallOutcome, Installer};
pub use orchestrator::{CommandOutcome, UpdateOrchestrator};
pub use selftest::{SelfTestBattery, SelfTestSupervisor};
pub use state::{BootOutcome, Directive, RestartCause, UpdateFlag, UpdateRecord, UpdateStateMachine};
pub use store::{FileStore, MemoryStore, StateStore};
pub use telemetry::{Publisher, StatusKeyword, Telemetry};
