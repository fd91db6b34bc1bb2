//! Telemetry Reporting
//!
//! Status and heartbeat messages published toward operators. The transport
//! itself lives behind [`Publisher`]; publish failures are logged and never
//! interrupt the update protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::command::DeviceTopics;
use super::state::UpdateRecord;
use crate::engine::platform::{HostProbe, ResourceProbe};

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Publish failed: {0}")]
    Publish(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outbound message sink (the publish/subscribe client in production)
pub trait Publisher {
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), TelemetryError>;
}

/// Status keywords understood by fleet tooling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKeyword {
    Idle,
    UpdateAvailable,
    Downloading,
    VerifyingSignature,
    Rejected,
    SignatureFailed,
    DownloadFailed,
    Rebooting,
    SelfTestRunning,
    Confirmed,
    RolledBack,
}

impl StatusKeyword {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::UpdateAvailable => "update_available",
            Self::Downloading => "downloading",
            Self::VerifyingSignature => "verifying_signature",
            Self::Rejected => "rejected",
            Self::SignatureFailed => "signature_failed",
            Self::DownloadFailed => "download_failed",
            Self::Rebooting => "rebooting",
            Self::SelfTestRunning => "self_test_running",
            Self::Confirmed => "confirmed",
            Self::RolledBack => "rolled_back",
        }
    }
}

/// Retained status message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub device_id: String,
    pub group: String,
    pub boot_id: Uuid,
    pub status: StatusKeyword,
    pub version: String,
    pub previous_version: String,
    pub boot_count: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub free_memory: Option<u64>,
    pub signal_dbm: Option<i32>,
    pub uptime_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Periodic liveness message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub device_id: String,
    pub group: String,
    pub boot_id: Uuid,
    pub version: String,
    /// `stable` or `self_test_running`
    pub state: String,
    pub free_memory: Option<u64>,
    pub signal_dbm: Option<i32>,
    pub uptime_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Builds and publishes status/heartbeat messages for one device
pub struct Telemetry<P: Publisher> {
    publisher: P,
    topics: DeviceTopics,
    boot_id: Uuid,
    started: Instant,
    probe: Box<dyn ResourceProbe + Send>,
    last_status: Option<StatusKeyword>,
}

impl<P: Publisher> Telemetry<P> {
    pub fn new(publisher: P, topics: DeviceTopics) -> Self {
        Self {
            publisher,
            topics,
            boot_id: Uuid::new_v4(),
            started: Instant::now(),
            probe: Box::new(HostProbe),
            last_status: None,
        }
    }

    pub fn with_probe(mut self, probe: impl ResourceProbe + Send + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn boot_id(&self) -> Uuid {
        self.boot_id
    }

    pub fn topics(&self) -> &DeviceTopics {
        &self.topics
    }

    pub fn last_status(&self) -> Option<StatusKeyword> {
        self.last_status
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn publisher_mut(&mut self) -> &mut P {
        &mut self.publisher
    }

    fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn status_report(
        &self,
        status: StatusKeyword,
        record: &UpdateRecord,
        detail: Option<&str>,
    ) -> StatusReport {
        let resources = self.probe.snapshot();
        StatusReport {
            device_id: self.topics.device_id.clone(),
            group: self.topics.group.clone(),
            boot_id: self.boot_id,
            status,
            version: record.current_version.clone(),
            previous_version: record.previous_version.clone(),
            boot_count: record.boot_attempts,
            detail: detail.map(str::to_string),
            free_memory: resources.free_memory,
            signal_dbm: resources.signal_dbm,
            uptime_ms: self.uptime_ms(),
            timestamp: Utc::now(),
        }
    }

    /// Publish a retained status message.
    pub fn status(&mut self, status: StatusKeyword, record: &UpdateRecord, detail: Option<&str>) {
        let report = self.status_report(status, record, detail);
        self.last_status = Some(status);
        let topic = self.topics.status();
        self.send(&topic, &report, true);
    }

    /// Publish a heartbeat; `verifying` selects the reported state.
    pub fn heartbeat(&mut self, record: &UpdateRecord, verifying: bool) {
        let resources = self.probe.snapshot();
        let heartbeat = Heartbeat {
            device_id: self.topics.device_id.clone(),
            group: self.topics.group.clone(),
            boot_id: self.boot_id,
            version: record.current_version.clone(),
            state: if verifying { "self_test_running" } else { "stable" }.to_string(),
            free_memory: resources.free_memory,
            signal_dbm: resources.signal_dbm,
            uptime_ms: self.uptime_ms(),
            timestamp: Utc::now(),
        };
        let topic = self.topics.heartbeat();
        self.send(&topic, &heartbeat, false);
    }

    fn send<T: Serialize>(&mut self, topic: &str, message: &T, retain: bool) {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic, error = %e, "Failed to encode telemetry");
                return;
            }
        };
        match self.publisher.publish(topic, &payload, retain) {
            Ok(()) => debug!(topic, "Telemetry published"),
            Err(e) => warn!(topic, error = %e, "Failed to publish telemetry"),
        }
    }
}

/// Fixed-interval heartbeat cadence, evaluated against an injected clock
#[derive(Debug, Clone)]
pub struct HeartbeatSchedule {
    interval: Duration,
    next_due: Duration,
}

impl HeartbeatSchedule {
    /// First heartbeat is due immediately at `now`.
    pub fn new(interval: Duration, now: Duration) -> Self {
        Self {
            interval,
            next_due: now,
        }
    }

    /// True at most once per interval.
    pub fn due(&mut self, now: Duration) -> bool {
        if now < self.next_due {
            return false;
        }
        // Skip missed beats instead of bursting
        while self.next_due <= now {
            self.next_due += self.interval.max(Duration::from_millis(1));
        }
        true
    }

    pub fn next_due(&self) -> Duration {
        self.next_due
    }
}

/// One published message as written to a line-oriented transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    #[serde(default)]
    pub retain: bool,
    pub payload: String,
}

/// Writes one JSON [`Envelope`] per line
pub struct JsonLinesPublisher<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesPublisher<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Publisher for JsonLinesPublisher<W> {
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), TelemetryError> {
        let envelope = Envelope {
            topic: topic.to_string(),
            retain,
            payload: payload.to_string(),
        };
        serde_json::to_writer(&mut self.writer, &envelope)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps every published envelope in memory
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    pub sent: Vec<Envelope>,
    pub fail: bool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status keywords in publish order
    pub fn statuses(&self) -> Vec<StatusKeyword> {
        self.status_reports().into_iter().map(|r| r.status).collect()
    }

    pub fn status_reports(&self) -> Vec<StatusReport> {
        self.sent
            .iter()
            .filter(|e| e.topic.starts_with("ota/status/"))
            .filter_map(|e| serde_json::from_str(&e.payload).ok())
            .collect()
    }

    pub fn heartbeats(&self) -> Vec<Heartbeat> {
        self.sent
            .iter()
            .filter(|e| e.topic.starts_with("ota/heartbeat/"))
            .filter_map(|e| serde_json::from_str(&e.payload).ok())
            .collect()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), TelemetryError> {
        if self.fail {
            return Err(TelemetryError::Publish("broker unreachable".into()));
        }
        self.sent.push(Envelope {
            topic: topic.to_string(),
            retain,
            payload: payload.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::platform::{FixedProbe, ResourceSnapshot};

    fn telemetry() -> Telemetry<RecordingPublisher> {
        Telemetry::new(RecordingPublisher::new(), DeviceTopics::new("esp-01", "canary")).with_probe(
            FixedProbe(ResourceSnapshot {
                free_memory: Some(32_768),
                signal_dbm: Some(-61),
            }),
        )
    }

    #[test]
    fn test_status_is_retained_with_record_fields() {
        let mut telemetry = telemetry();
        let mut record = UpdateRecord::initial("1.1.0");
        record.previous_version = "1.0.0".into();
        record.boot_attempts = 1;

        telemetry.status(StatusKeyword::SelfTestRunning, &record, Some("retrying"));

        let envelope = &telemetry.publisher().sent[0];
        assert_eq!(envelope.topic, "ota/status/esp-01");
        assert!(envelope.retain);

        let report: StatusReport = serde_json::from_str(&envelope.payload).unwrap();
        assert_eq!(report.status, StatusKeyword::SelfTestRunning);
        assert_eq!(report.version, "1.1.0");
        assert_eq!(report.previous_version, "1.0.0");
        assert_eq!(report.boot_count, 1);
        assert_eq!(report.detail.as_deref(), Some("retrying"));
        assert_eq!(report.free_memory, Some(32_768));
        assert_eq!(report.signal_dbm, Some(-61));
        assert_eq!(report.boot_id, telemetry.boot_id());
        assert!(envelope.payload.contains("\"status\":\"self_test_running\""));
    }

    #[test]
    fn test_heartbeat_not_retained() {
        let mut telemetry = telemetry();
        telemetry.heartbeat(&UpdateRecord::initial("1.0.0"), false);

        let envelope = &telemetry.publisher().sent[0];
        assert_eq!(envelope.topic, "ota/heartbeat/esp-01");
        assert!(!envelope.retain);
        assert_eq!(telemetry.publisher().heartbeats()[0].state, "stable");
    }

    #[test]
    fn test_publish_failure_is_absorbed() {
        let mut telemetry = telemetry();
        telemetry.publisher_mut().fail = true;
        telemetry.status(StatusKeyword::Idle, &UpdateRecord::initial("1.0.0"), None);
        assert!(telemetry.publisher().sent.is_empty());
        assert_eq!(telemetry.last_status(), Some(StatusKeyword::Idle));
    }

    #[test]
    fn test_keyword_strings_match_serde() {
        for keyword in [
            StatusKeyword::Idle,
            StatusKeyword::UpdateAvailable,
            StatusKeyword::VerifyingSignature,
            StatusKeyword::DownloadFailed,
            StatusKeyword::RolledBack,
        ] {
            let json = serde_json::to_string(&keyword).unwrap();
            assert_eq!(json, format!("\"{}\"", keyword.as_str()));
        }
    }

    #[test]
    fn test_heartbeat_schedule() {
        let mut schedule = HeartbeatSchedule::new(Duration::from_secs(60), Duration::ZERO);
        assert!(schedule.due(Duration::ZERO));
        assert!(!schedule.due(Duration::from_secs(59)));
        assert!(schedule.due(Duration::from_secs(60)));
        assert!(!schedule.due(Duration::from_secs(61)));

        // Long stall: one beat, not a burst
        assert!(schedule.due(Duration::from_secs(400)));
        assert!(!schedule.due(Duration::from_secs(401)));
        assert_eq!(schedule.next_due(), Duration::from_secs(420));
    }

    #[test]
    fn test_json_lines_publisher() {
        let mut publisher = JsonLinesPublisher::new(Vec::new());
        publisher.publish("ota/status/a", "{\"x\":1}", true).unwrap();
        publisher.publish("ota/heartbeat/a", "{}", false).unwrap();

        let output = String::from_utf8(publisher.into_inner()).unwrap();
        let lines: Vec<Envelope> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].topic, "ota/status/a");
        assert!(lines[0].retain);
        assert_eq!(lines[1].payload, "{}");
    }
}
