// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod snapshots;
pub use snapshots::*;

use crate::anr::AnrValidation;
use crate::breadcrumbs::Breadcrumb;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use uuid::Uuid;

/// Symbolic crash families.  Free-form kinds (e.g. a host-language exception
/// class) are carried verbatim in `exception_kind`; these constants name the
/// families the crate itself produces.
pub const KIND_NATIVE_SIGNAL: &str = "NativeSignal";
pub const KIND_UNHANDLED_EXCEPTION: &str = "UnhandledException";
pub const KIND_ANR: &str = "ANR";

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
        }
    }
}

/// The durable unit: everything known about one crash, as persisted to
/// `pending/` and eventually posted to the ingestion endpoint.
///
/// Fields that a given path cannot populate stay empty; the payload optimizer
/// removes empty fields from the serialized form before transport, so the
/// model can afford to be wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashReport {
    pub crash_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub exception_kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub exception_message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub stack_trace: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub thread_name: String,
    #[serde(default)]
    pub device: DeviceSnapshot,
    #[serde(default)]
    pub app: AppSnapshot,
    #[serde(default)]
    pub device_state: DeviceStateSnapshot,
    #[serde(default)]
    pub network: NetworkSnapshot,
    #[serde(default)]
    pub memory: MemoryInfo,
    #[serde(default)]
    pub cpu: CpuInfo,
    #[serde(default)]
    pub process: ProcessSnapshot,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(default)]
    pub threads: Vec<ThreadSnapshot>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(default)]
    pub breadcrumbs: Vec<Breadcrumb>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    #[serde(default)]
    pub custom_data: HashMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub environment: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub fingerprint: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    #[serde(default)]
    pub issue_title: String,
    pub severity: Severity,
    #[serde(default)]
    pub is_anr: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub anr_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub anr_validation: Option<AnrValidation>,
    #[serde(default)]
    pub is_startup_crash: bool,
    #[serde(default)]
    pub is_crash_loop: bool,
    #[serde(default)]
    pub startup_crash_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub native: Option<NativeCrashDetails>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(default)]
    pub recent_logs: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(default)]
    pub memory_warnings: Vec<StateEvent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(default)]
    pub network_changes: Vec<StateEvent>,
}

impl CrashReport {
    pub fn new(exception_kind: impl Into<String>) -> Self {
        Self {
            crash_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            exception_kind: exception_kind.into(),
            exception_message: String::new(),
            stack_trace: String::new(),
            thread_name: String::new(),
            device: DeviceSnapshot::default(),
            app: AppSnapshot::default(),
            device_state: DeviceStateSnapshot::default(),
            network: NetworkSnapshot::default(),
            memory: MemoryInfo::default(),
            cpu: CpuInfo::default(),
            process: ProcessSnapshot::default(),
            threads: Vec::new(),
            breadcrumbs: Vec::new(),
            custom_data: HashMap::new(),
            environment: String::new(),
            fingerprint: String::new(),
            issue_title: String::new(),
            severity: Severity::Medium,
            is_anr: false,
            anr_duration_ms: None,
            anr_validation: None,
            is_startup_crash: false,
            is_crash_loop: false,
            startup_crash_count: 0,
            native: None,
            recent_logs: Vec::new(),
            memory_warnings: Vec::new(),
            network_changes: Vec::new(),
        }
    }

    /// True for records the sampler must never drop.  Mirrors the grouping
    /// rules: native signals, UI-thread crashes, OOMs, ANRs, startup crashes
    /// and anything already Critical terminate the process or are too rare to
    /// sample away.
    pub fn is_fatal(&self) -> bool {
        self.native.is_some()
            || self.exception_kind.starts_with("SIG")
            || self.exception_kind == KIND_NATIVE_SIGNAL
            || self.is_anr
            || self.is_startup_crash
            || self.crashed_on_main_thread()
            || self.is_out_of_memory()
            || self.severity == Severity::Critical
    }

    pub fn crashed_on_main_thread(&self) -> bool {
        self.thread_name == "main" || self.thread_name == "ui"
    }

    pub fn is_out_of_memory(&self) -> bool {
        let kind = self.exception_kind.to_ascii_lowercase();
        kind.contains("outofmemory") || kind.contains("oom")
    }

    pub fn to_file(&self, path: &Path) -> anyhow::Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer(file, self)
            .with_context(|| format!("Failed to write json to {}", path.display()))?;
        Ok(())
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        serde_json::from_reader(file)
            .with_context(|| format!("Failed to parse json in {}", path.display()))
    }
}
