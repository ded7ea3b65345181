// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-demand reads of device conditions: process importance, screen, power,
//! battery, memory and storage.
//!
//! Every query returns a safe default on failure and none may panic or block
//! beyond a few milliseconds; the one exception is the disk throughput probe,
//! which performs a real 1 MiB write+read and is only run when the host opts
//! in (see [`crate::CrashtrackerConfig::enable_disk_probe`]).

use crate::crash_info::DeviceStateSnapshot;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Instant;
use sysinfo::{System, SystemExt};
use tracing::debug;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessImportance {
    Foreground,
    Visible,
    Service,
    Background,
    Unknown,
}

impl ProcessImportance {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessImportance::Foreground => "foreground",
            ProcessImportance::Visible => "visible",
            ProcessImportance::Service => "service",
            ProcessImportance::Background => "background",
            ProcessImportance::Unknown => "unknown",
        }
    }

    /// The validation engine treats anything the user could be watching as
    /// eligible for an ANR report.
    pub fn user_facing(&self) -> bool {
        matches!(
            self,
            ProcessImportance::Foreground | ProcessImportance::Visible | ProcessImportance::Unknown
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryPressure {
    Low,
    Moderate,
    High,
    Critical,
    Unknown,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskProbeResult {
    pub write_mbps: f64,
    pub read_mbps: f64,
}

/// Pull-style oracle over device conditions.
///
/// Implementations must never panic; a query that cannot be answered returns
/// the documented safe default.  The defaults are chosen so that ANR
/// validation over-reports rather than misses: an oracle that knows nothing
/// looks like a foreground app with the screen on.
pub trait DeviceStateSource: Send + Sync {
    fn process_importance(&self) -> ProcessImportance;
    fn screen_on(&self) -> bool;
    fn power_save(&self) -> bool;
    /// Battery charge in `0.0..=1.0`; `1.0` when unknown.
    fn battery_fraction(&self) -> f64;
    fn charging(&self) -> Option<bool>;
    /// "portrait", "landscape" or "" when unknown.
    fn orientation(&self) -> String;
    fn memory_pressure(&self) -> MemoryPressure;
    fn vpn_active(&self) -> bool;
    fn proxy_active(&self) -> bool;
    fn boot_time_ms(&self) -> u64;
    fn uptime_ms(&self) -> u64;
    fn timezone_id(&self) -> String;
    /// (available, total) bytes of RAM.
    fn memory_stats(&self) -> (Option<u64>, Option<u64>);
    /// (available, total) bytes of storage under `path`.
    fn storage_stats(&self, path: &Path) -> (Option<u64>, Option<u64>);

    /// One 1 MiB write+read in `cache_dir`; the temp file is removed before
    /// returning.  Failures report zero metrics.
    fn disk_probe(&self, cache_dir: &Path) -> DiskProbeResult {
        run_disk_probe(cache_dir).unwrap_or_default()
    }

    /// Assemble the point-in-time snapshot folded into every crash record.
    fn snapshot(&self, data_dir: &Path) -> DeviceStateSnapshot {
        let (memory_available, memory_total) = self.memory_stats();
        let (storage_available, storage_total) = self.storage_stats(data_dir);
        let pressure = self.memory_pressure();
        DeviceStateSnapshot {
            battery_fraction: Some(self.battery_fraction()),
            charging: self.charging(),
            memory_available,
            memory_total,
            storage_available,
            storage_total,
            screen_on: Some(self.screen_on()),
            orientation: self.orientation(),
            low_memory: match pressure {
                MemoryPressure::Unknown => None,
                p => Some(matches!(p, MemoryPressure::High | MemoryPressure::Critical)),
            },
        }
    }
}

fn run_disk_probe(cache_dir: &Path) -> anyhow::Result<DiskProbeResult> {
    const PROBE_BYTES: usize = 1024 * 1024;
    let path = cache_dir.join(".disk_probe.tmp");
    let payload = vec![0xa5u8; PROBE_BYTES];

    let started = Instant::now();
    let mut file = std::fs::File::create(&path)?;
    file.write_all(&payload)?;
    file.sync_all()?;
    let write_secs = started.elapsed().as_secs_f64();

    let started = Instant::now();
    let mut file = std::fs::File::open(&path)?;
    let mut buf = Vec::with_capacity(PROBE_BYTES);
    file.read_to_end(&mut buf)?;
    let read_secs = started.elapsed().as_secs_f64();

    // Best effort: the probe must not leave litter in the cache.
    let _ = std::fs::remove_file(&path);

    let mb = PROBE_BYTES as f64 / (1024.0 * 1024.0);
    Ok(DiskProbeResult {
        write_mbps: if write_secs > 0.0 { mb / write_secs } else { 0.0 },
        read_mbps: if read_secs > 0.0 { mb / read_secs } else { 0.0 },
    })
}

/// System-backed oracle.  Memory and uptime come from the OS; the
/// platform-mediated facts (importance, screen, power, battery) have no
/// portable source and stay at their safe defaults unless the host pushes
/// fresher values through the setters.
pub struct SystemStateSource {
    inner: std::sync::Mutex<System>,
    screen_on: std::sync::atomic::AtomicBool,
    power_save: std::sync::atomic::AtomicBool,
}

impl SystemStateSource {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(System::new()),
            screen_on: std::sync::atomic::AtomicBool::new(true),
            power_save: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_screen_on(&self, on: bool) {
        self.screen_on.store(on, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn set_power_save(&self, on: bool) {
        self.power_save.store(on, std::sync::atomic::Ordering::Relaxed);
    }
}

impl Default for SystemStateSource {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStateSource for SystemStateSource {
    fn process_importance(&self) -> ProcessImportance {
        // We are running, and nothing tells us otherwise.
        ProcessImportance::Foreground
    }

    fn screen_on(&self) -> bool {
        self.screen_on.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn power_save(&self) -> bool {
        self.power_save.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn battery_fraction(&self) -> f64 {
        1.0
    }

    fn charging(&self) -> Option<bool> {
        None
    }

    fn orientation(&self) -> String {
        String::new()
    }

    fn memory_pressure(&self) -> MemoryPressure {
        match self.memory_stats() {
            (Some(available), Some(total)) if total > 0 => {
                let free = available as f64 / total as f64;
                if free < 0.05 {
                    MemoryPressure::Critical
                } else if free < 0.10 {
                    MemoryPressure::High
                } else if free < 0.25 {
                    MemoryPressure::Moderate
                } else {
                    MemoryPressure::Low
                }
            }
            _ => MemoryPressure::Unknown,
        }
    }

    fn vpn_active(&self) -> bool {
        false
    }

    fn proxy_active(&self) -> bool {
        std::env::var("HTTPS_PROXY").is_ok() || std::env::var("HTTP_PROXY").is_ok()
    }

    fn boot_time_ms(&self) -> u64 {
        match self.inner.lock() {
            Ok(sys) => sys.boot_time().saturating_mul(1000),
            Err(_) => 0,
        }
    }

    fn uptime_ms(&self) -> u64 {
        match self.inner.lock() {
            Ok(sys) => sys.uptime().saturating_mul(1000),
            Err(_) => 0,
        }
    }

    fn timezone_id(&self) -> String {
        std::env::var("TZ").unwrap_or_default()
    }

    fn memory_stats(&self) -> (Option<u64>, Option<u64>) {
        match self.inner.lock() {
            Ok(mut sys) => {
                sys.refresh_memory();
                (Some(sys.available_memory()), Some(sys.total_memory()))
            }
            Err(_) => {
                debug!("memory stats unavailable, oracle poisoned");
                (None, None)
            }
        }
    }

    #[cfg(unix)]
    fn storage_stats(&self, path: &Path) -> (Option<u64>, Option<u64>) {
        match nix::sys::statvfs::statvfs(path) {
            Ok(stat) => {
                let frag = stat.fragment_size() as u64;
                (
                    Some(stat.blocks_available() as u64 * frag),
                    Some(stat.blocks() as u64 * frag),
                )
            }
            Err(_) => (None, None),
        }
    }

    #[cfg(not(unix))]
    fn storage_stats(&self, _path: &Path) -> (Option<u64>, Option<u64>) {
        (None, None)
    }
}

/// Test double: every query answers from a plain field.
#[derive(Debug, Clone)]
pub struct FixedStateSource {
    pub importance: ProcessImportance,
    pub screen_on: bool,
    pub power_save: bool,
    pub battery_fraction: f64,
    pub memory_pressure: MemoryPressure,
    pub boot_time_ms: u64,
    pub uptime_ms: u64,
}

impl Default for FixedStateSource {
    fn default() -> Self {
        Self {
            importance: ProcessImportance::Foreground,
            screen_on: true,
            power_save: false,
            battery_fraction: 0.80,
            memory_pressure: MemoryPressure::Low,
            boot_time_ms: 0,
            uptime_ms: 0,
        }
    }
}

impl DeviceStateSource for FixedStateSource {
    fn process_importance(&self) -> ProcessImportance {
        self.importance
    }
    fn screen_on(&self) -> bool {
        self.screen_on
    }
    fn power_save(&self) -> bool {
        self.power_save
    }
    fn battery_fraction(&self) -> f64 {
        self.battery_fraction
    }
    fn charging(&self) -> Option<bool> {
        None
    }
    fn orientation(&self) -> String {
        "portrait".to_string()
    }
    fn memory_pressure(&self) -> MemoryPressure {
        self.memory_pressure
    }
    fn vpn_active(&self) -> bool {
        false
    }
    fn proxy_active(&self) -> bool {
        false
    }
    fn boot_time_ms(&self) -> u64 {
        self.boot_time_ms
    }
    fn uptime_ms(&self) -> u64 {
        self.uptime_ms
    }
    fn timezone_id(&self) -> String {
        "UTC".to_string()
    }
    fn memory_stats(&self) -> (Option<u64>, Option<u64>) {
        (Some(2 << 30), Some(4 << 30))
    }
    fn storage_stats(&self, _path: &Path) -> (Option<u64>, Option<u64>) {
        (Some(8 << 30), Some(64 << 30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_has_safe_defaults() {
        let oracle = FixedStateSource::default();
        let dir = tempfile::tempdir().unwrap();
        let snapshot = oracle.snapshot(dir.path());
        assert_eq!(snapshot.battery_fraction, Some(0.80));
        assert_eq!(snapshot.screen_on, Some(true));
        assert_eq!(snapshot.low_memory, Some(false));
    }

    #[test]
    fn test_disk_probe_cleans_up() {
        let oracle = FixedStateSource::default();
        let dir = tempfile::tempdir().unwrap();
        let result = oracle.disk_probe(dir.path());
        assert!(result.write_mbps >= 0.0 && result.read_mbps >= 0.0);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_system_source_memory() {
        let oracle = SystemStateSource::new();
        let (available, total) = oracle.memory_stats();
        assert!(total.unwrap_or(0) >= available.unwrap_or(0));
    }

    #[test]
    fn test_unknown_importance_is_user_facing() {
        assert!(ProcessImportance::Unknown.user_facing());
        assert!(!ProcessImportance::Background.user_facing());
        assert!(!ProcessImportance::Service.user_facing());
    }
}
