// OtaGuard Engine - Core module structure
pub mod config;
pub mod cli;
pub mod fleet;
pub mod platform;
pub mod runtime;
pub mod updater;

pub use config::Config;
pub use runtime::Device;
