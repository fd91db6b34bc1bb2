//! Fleet View
//!
//! Operator-side aggregation of status and heartbeat envelopes into one
//! row per device.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use super::updater::telemetry::{Envelope, Heartbeat, StatusKeyword, StatusReport};

const STATUS_PREFIX: &str = "ota/status/";
const HEARTBEAT_PREFIX: &str = "ota/heartbeat/";

/// Statuses a heartbeat must not overwrite
const STICKY: [&str; 3] = ["downloading", "self_test_running", "rebooting"];

/// Last known state of one device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceView {
    pub device_id: String,
    pub group: String,
    pub version: String,
    pub status: String,
    pub previous_version: Option<String>,
    pub boot_count: Option<u8>,
    pub detail: Option<String>,
    pub free_memory: Option<u64>,
    pub signal_dbm: Option<i32>,
    pub uptime_ms: u64,
    pub last_seen: DateTime<Utc>,
}

impl DeviceView {
    fn new(device_id: &str, group: &str, now: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            group: group.to_string(),
            version: String::new(),
            status: "unknown".to_string(),
            previous_version: None,
            boot_count: None,
            detail: None,
            free_memory: None,
            signal_dbm: None,
            uptime_ms: 0,
            last_seen: now,
        }
    }

    fn apply_status(&mut self, report: StatusReport, now: DateTime<Utc>) {
        self.group = report.group;
        self.version = report.version;
        self.status = report.status.as_str().to_string();
        self.previous_version = Some(report.previous_version).filter(|v| !v.is_empty());
        self.boot_count = Some(report.boot_count);
        self.detail = report.detail;
        self.free_memory = report.free_memory.or(self.free_memory);
        self.signal_dbm = report.signal_dbm.or(self.signal_dbm);
        self.uptime_ms = report.uptime_ms;
        self.last_seen = now;
    }

    fn apply_heartbeat(&mut self, heartbeat: Heartbeat, now: DateTime<Utc>) {
        self.group = heartbeat.group;
        self.version = heartbeat.version;
        if !STICKY.contains(&self.status.as_str()) {
            self.status = heartbeat.state;
        }
        self.free_memory = heartbeat.free_memory.or(self.free_memory);
        self.signal_dbm = heartbeat.signal_dbm.or(self.signal_dbm);
        self.uptime_ms = heartbeat.uptime_ms;
        self.last_seen = now;
    }
}

/// Devices keyed by id
#[derive(Debug, Clone, Default)]
pub struct FleetView {
    devices: BTreeMap<String, DeviceView>,
}

impl FleetView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one envelope. Returns the updated device, or `None` when the
    /// envelope is not fleet telemetry or does not decode.
    pub fn merge(&mut self, envelope: &Envelope, now: DateTime<Utc>) -> Option<&DeviceView> {
        if envelope.topic.starts_with(STATUS_PREFIX) {
            let report: StatusReport = serde_json::from_str(&envelope.payload).ok()?;
            let view = self.entry(&report.device_id, &report.group, now);
            view.apply_status(report, now);
            Some(view)
        } else if envelope.topic.starts_with(HEARTBEAT_PREFIX) {
            let heartbeat: Heartbeat = serde_json::from_str(&envelope.payload).ok()?;
            let view = self.entry(&heartbeat.device_id, &heartbeat.group, now);
            view.apply_heartbeat(heartbeat, now);
            Some(view)
        } else {
            None
        }
    }

    fn entry(&mut self, device_id: &str, group: &str, now: DateTime<Utc>) -> &mut DeviceView {
        self.devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceView::new(device_id, group, now))
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceView> {
        self.devices.get(device_id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceView> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Device count per status
    pub fn summary(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for device in self.devices.values() {
            *counts.entry(device.status.clone()).or_insert(0) += 1;
        }
        counts
    }
}

/// Short label with a glyph for a status string
pub fn status_label(status: &str) -> String {
    let keyword: Option<StatusKeyword> = serde_json::from_value(serde_json::Value::String(status.to_string())).ok();
    let label = match keyword {
        Some(StatusKeyword::Idle) => "● idle",
        Some(StatusKeyword::Confirmed) => "✓ confirmed",
        Some(StatusKeyword::Downloading) => "↓ downloading",
        Some(StatusKeyword::UpdateAvailable) => "↑ update avail",
        Some(StatusKeyword::VerifyingSignature) => "… verifying",
        Some(StatusKeyword::Rejected) => "✗ rejected",
        Some(StatusKeyword::SignatureFailed) => "✗ bad signature",
        Some(StatusKeyword::SelfTestRunning) => "⧖ testing",
        Some(StatusKeyword::Rebooting) => "↻ rebooting",
        Some(StatusKeyword::DownloadFailed) => "✗ dl failed",
        Some(StatusKeyword::RolledBack) => "⟲ rolled back",
        None if status == "stable" => "● stable",
        None => return format!("? {status}"),
    };
    label.to_string()
}
