//! Update Commands
//!
//! Wire model of the inbound command channel and the topic layout used to
//! address one device, a group, or the whole fleet.

use serde::{Deserialize, Serialize};

use super::error::UpdateFault;
use super::state::UpdateRecord;

/// One inbound update command. Never persisted.
///
/// Fields the protocol requires are still `Option` here so a missing field is
/// reported as a malformed command instead of a decode error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCommand {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "sha256", skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default)]
    pub force: bool,
}

/// A command whose required fields are known to be present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidCommand<'a> {
    pub version: &'a str,
    pub url: &'a str,
    pub checksum: &'a str,
    pub force: bool,
}

impl UpdateCommand {
    /// Decode a command payload. Unknown publisher fields are ignored.
    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Check required fields and that the values fit the persisted record.
    pub fn validate(&self) -> Result<ValidCommand<'_>, UpdateFault> {
        let version = non_empty(self.version.as_deref())
            .ok_or_else(|| UpdateFault::MalformedCommand("missing version".into()))?;
        let url = non_empty(self.url.as_deref())
            .ok_or_else(|| UpdateFault::MalformedCommand("missing url".into()))?;
        let checksum = self.checksum.as_deref().unwrap_or_default();

        if let Some(problem) = version_name_problem(version) {
            return Err(UpdateFault::MalformedCommand(problem.into()));
        }
        UpdateRecord::check_fits(version, checksum)
            .map_err(|e| UpdateFault::MalformedCommand(e.to_string()))?;

        Ok(ValidCommand {
            version,
            url,
            checksum,
            force: self.force,
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Why `version` cannot name a firmware slot directory, if it cannot.
pub fn version_name_problem(version: &str) -> Option<&'static str> {
    if version.starts_with('.') {
        Some("version must not start with '.'")
    } else if version.contains(['/', '\\']) {
        Some("version must not contain path separators")
    } else if version.contains("..") {
        Some("version must not contain '..'")
    } else if version.chars().any(char::is_control) {
        Some("version must not contain control characters")
    } else {
        None
    }
}

/// Release-hosted firmware location for a version
pub fn release_firmware_url(repo: &str, version: &str) -> String {
    format!("https://github.com/{repo}/releases/download/v{version}/firmware.bin")
}

/// Who a command is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandTarget {
    Device(String),
    Group(String),
    Fleet,
}

impl CommandTarget {
    pub fn topic(&self) -> String {
        match self {
            Self::Device(id) => format!("ota/device/{id}"),
            Self::Group(group) => format!("ota/group/{group}"),
            Self::Fleet => "ota/fleet/all".to_string(),
        }
    }
}

/// Every topic a single device listens or publishes on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    pub device_id: String,
    pub group: String,
}

impl DeviceTopics {
    pub fn new(device_id: &str, group: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            group: group.to_string(),
        }
    }

    /// Command topics to subscribe to, most specific first
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            CommandTarget::Device(self.device_id.clone()).topic(),
            CommandTarget::Group(self.group.clone()).topic(),
            CommandTarget::Fleet.topic(),
        ]
    }

    pub fn accepts(&self, topic: &str) -> bool {
        self.subscriptions().iter().any(|t| t == topic)
    }

    pub fn status(&self) -> String {
        format!("ota/status/{}", self.device_id)
    }

    pub fn heartbeat(&self) -> String {
        format!("ota/heartbeat/{}", self.device_id)
    }
}
