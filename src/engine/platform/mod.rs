//! Platform Detection and Resource Probes
//!
//! Host directories and the resource readings reported in telemetry and
//! checked by the self-test battery.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Supported platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    MacOS,
    Linux,
    Windows,
    Unknown,
}

impl Platform {
    /// Detect current platform
    pub fn current() -> Self {
        #[cfg(target_os = "macos")]
        return Platform::MacOS;

        #[cfg(target_os = "linux")]
        return Platform::Linux;

        #[cfg(target_os = "windows")]
        return Platform::Windows;

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        return Platform::Unknown;
    }

    pub fn is_linux(&self) -> bool {
        matches!(self, Platform::Linux)
    }

    /// Default agent data directory (record, firmware images, config)
    pub fn data_dir(&self) -> Option<PathBuf> {
        match self {
            Platform::MacOS => dirs::data_dir().map(|d| d.join("OtaGuard")),
            Platform::Linux => dirs::data_dir().map(|d| d.join("otaguard")),
            Platform::Windows => dirs::data_local_dir().map(|d| d.join("OtaGuard")),
            Platform::Unknown => None,
        }
    }
}

/// Point-in-time resource readings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Memory available to new allocations, in bytes
    pub free_memory: Option<u64>,
    /// Link signal strength; hosted devices have none
    pub signal_dbm: Option<i32>,
}

/// Source of resource readings
pub trait ResourceProbe {
    fn snapshot(&self) -> ResourceSnapshot;
}

/// Reads the running host
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProbe;

impl ResourceProbe for HostProbe {
    fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            free_memory: available_memory(),
            signal_dbm: None,
        }
    }
}

/// Fixed readings, for tests and simulators
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedProbe(pub ResourceSnapshot);

impl ResourceProbe for FixedProbe {
    fn snapshot(&self) -> ResourceSnapshot {
        self.0
    }
}

/// Available memory in bytes, if the platform exposes it
pub fn available_memory() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let content = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_meminfo_available(&content)
    }

    #[cfg(not(target_os = "linux"))]
    None
}

/// Extract `MemAvailable` (reported in kB) from `/proc/meminfo` content.
pub fn parse_meminfo_available(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_detection() {
        let platform = Platform::current();

        #[cfg(target_os = "linux")]
        assert!(platform.is_linux());

        #[cfg(not(target_os = "linux"))]
        assert!(!platform.is_linux());
    }

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:       16303428 kB\nMemFree:         1234567 kB\nMemAvailable:    8000000 kB\n";
        assert_eq!(parse_meminfo_available(content), Some(8_000_000 * 1024));
        assert_eq!(parse_meminfo_available("MemTotal: 1 kB\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_host_probe_reads_memory() {
        assert!(HostProbe.snapshot().free_memory.unwrap_or(0) > 0);
    }
}
