//! OtaGuard Configuration Module
//! Handles loading and validating otaguard.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use super::runtime::DeviceSettings;
use super::updater::auth::CommandAuthenticator;
use super::updater::selftest::SupervisorSettings;
use super::updater::state::MachineSettings;

pub const CONFIG_FILE: &str = "otaguard.config.json";

/// Overrides `security.signing_secret` when set
pub const SECRET_ENV: &str = "OTAGUARD_SIGNING_SECRET";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    pub device: DeviceConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub self_test: SelfTestConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default = "default_group")]
    pub group: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub signing_secret: String,
    #[serde(default = "default_true")]
    pub require_signature: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default = "default_max_boot_failures")]
    pub max_boot_failures: u8,
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
    /// Version recorded on first-ever boot
    #[serde(default = "default_version")]
    pub default_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfTestConfig {
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,
    #[serde(default = "default_self_test_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_min_free_memory")]
    pub min_free_memory_bytes: u64,
    /// `host:port` that must accept a TCP connection, typically the broker
    #[serde(default)]
    pub probe_address: String,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Relative paths resolve against the config directory
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_firmware_dir")]
    pub firmware_dir: PathBuf,
}

fn default_group() -> String {
    "fleet".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_boot_failures() -> u8 {
    3
}

fn default_install_timeout() -> u64 {
    120
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_settle_delay() -> u64 {
    5
}

fn default_self_test_timeout() -> u64 {
    60
}

fn default_min_free_memory() -> u64 {
    16 * 1024 * 1024
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_state_path() -> PathBuf {
    PathBuf::from("./data/update.rec")
}

fn default_firmware_dir() -> PathBuf {
    PathBuf::from("./data/firmware")
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            signing_secret: String::new(),
            require_signature: default_true(),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            max_boot_failures: default_max_boot_failures(),
            install_timeout_secs: default_install_timeout(),
            default_version: default_version(),
        }
    }
}

impl Default for SelfTestConfig {
    fn default() -> Self {
        Self {
            settle_delay_secs: default_settle_delay(),
            timeout_secs: default_self_test_timeout(),
            min_free_memory_bytes: default_min_free_memory(),
            probe_address: String::new(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            firmware_dir: default_firmware_dir(),
        }
    }
}

impl Config {
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let mut config: Config = serde_json::from_str(&content)?;
        config.apply_secret_override(std::env::var(SECRET_ENV).ok());
        Ok(config)
    }

    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir)?;
        let config_path = config_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn default_for_device(id: &str, group: &str) -> Self {
        Self {
            version: "1".to_string(),
            device: DeviceConfig {
                id: id.to_string(),
                group: group.to_string(),
            },
            security: SecurityConfig::default(),
            update: UpdateConfig::default(),
            self_test: SelfTestConfig::default(),
            telemetry: TelemetryConfig::default(),
            storage: StorageConfig::default(),
        }
    }

    /// A non-empty override replaces the configured secret.
    pub fn apply_secret_override(&mut self, value: Option<String>) {
        if let Some(secret) = value.filter(|s| !s.is_empty()) {
            self.security.signing_secret = secret;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_topic_segment("device.id", &self.device.id)?;
        check_topic_segment("device.group", &self.device.group)?;

        if self.update.max_boot_failures == 0 {
            return Err(ConfigError::Invalid("update.max_boot_failures must be at least 1".into()));
        }
        if self.update.install_timeout_secs == 0 {
            return Err(ConfigError::Invalid("update.install_timeout_secs must be positive".into()));
        }
        check_probe_address(&self.self_test.probe_address)?;
        if self.self_test.probe_timeout_secs == 0 {
            return Err(ConfigError::Invalid("self_test.probe_timeout_secs must be positive".into()));
        }
        if self.self_test.timeout_secs == 0 {
            return Err(ConfigError::Invalid("self_test.timeout_secs must be positive".into()));
        }
        if self.telemetry.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "telemetry.heartbeat_interval_secs must be positive".into(),
            ));
        }
        if self.security.require_signature && self.security.signing_secret.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "signatures are required but no signing secret is set (config or {SECRET_ENV})"
            )));
        }
        Ok(())
    }

    pub fn state_path(&self, config_dir: &Path) -> PathBuf {
        resolve(config_dir, &self.storage.state_path)
    }

    pub fn firmware_dir(&self, config_dir: &Path) -> PathBuf {
        resolve(config_dir, &self.storage.firmware_dir)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.update.install_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.self_test.probe_timeout_secs)
    }

    pub fn authenticator(&self) -> CommandAuthenticator {
        CommandAuthenticator::new(&self.security.signing_secret, self.security.require_signature)
    }

    pub fn device_settings(&self) -> DeviceSettings {
        DeviceSettings {
            machine: MachineSettings {
                max_boot_failures: self.update.max_boot_failures,
                default_version: self.update.default_version.clone(),
            },
            supervisor: SupervisorSettings {
                settle_delay: Duration::from_secs(self.self_test.settle_delay_secs),
                deadline: Duration::from_secs(self.self_test.timeout_secs),
            },
            heartbeat_interval: Duration::from_secs(self.telemetry.heartbeat_interval_secs),
        }
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn check_probe_address(address: &str) -> Result<(), ConfigError> {
    let port = address
        .rsplit_once(':')
        .filter(|(host, _)| !host.is_empty())
        .and_then(|(_, port)| port.parse::<u16>().ok());
    if port.is_none() {
        return Err(ConfigError::Invalid(format!(
            "self_test.probe_address must be host:port, got {address:?}"
        )));
    }
    Ok(())
}

/// Ids end up in topic names; wildcard and separator characters are refused.
fn check_topic_segment(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must not be empty")));
    }
    if value.contains(['/', '#', '+']) || value.chars().any(char::is_whitespace) {
        return Err(ConfigError::Invalid(format!("{field} contains reserved characters: {value}")));
    }
    Ok(())
}
